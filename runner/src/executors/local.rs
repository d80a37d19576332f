use super::{Executor, ExecutorError};
use crate::{
    config::{InitConfig, Mode, RunConfig, TargetConfig},
    database::{BenchmarkBundle, BenchmarkResult, SystemMetric},
    ingest::{pgbench, RunOutput},
    monitor::{monitor, MonitorError, Probe, SysinfoProbe},
    observer::{Event, Observer, Silent},
    stats::SampleSeries,
};
use chrono::Utc;
use crossbeam_channel::{bounded, unbounded};
use itertools::Itertools;
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use std::{
    io::Read,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, trace, warn};
use wait_timeout::ChildExt;

/// How often a running child is checked for the deadline and for failures of the sampler
const POLL_INTERVAL: Duration = Duration::from_millis(50);

type ProbeFactory = Box<dyn Fn() -> Result<Box<dyn Probe>, MonitorError> + Send + Sync>;

/// Executor that runs the load generation tool as a child process on this machine
pub struct LocalExecutor {
    tool: PathBuf,
    probe: ProbeFactory,
    observer: Arc<dyn Observer>,
}

/// Everything captured during one run
#[derive(Debug)]
pub(crate) struct Execution {
    pub output: RunOutput,
    pub cpu: SampleSeries,
    pub memory: SampleSeries,
}

/// Slot for the first error any thread of a run reports, later errors are only logged
#[derive(Default)]
struct FirstError(Mutex<Option<ExecutorError>>);

impl FirstError {
    fn record(&self, error: ExecutorError) {
        let mut slot = self.0.lock();

        if slot.is_none() {
            *slot = Some(error);
        } else {
            debug!(error = %error, "Dropping follow-up error");
        }
    }

    fn is_set(&self) -> bool {
        self.0.lock().is_some()
    }

    fn into_inner(self) -> Option<ExecutorError> {
        self.0.into_inner()
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> Result<String, ExecutorError> {
    let mut buffer = Vec::new();

    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buffer)
            .map_err(ExecutorError::Capture)?;
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Kill the process group of `child`, forked helpers would otherwise keep the pipes open
fn terminate(child: &mut Child) {
    // the child leads its own group, see `LocalExecutor::command`
    match i32::try_from(child.id()) {
        Ok(pid) => {
            if let Err(error) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                debug!(error = ?error, "Failed to kill tool, it most likely exited already");
            }
        }
        Err(_) => {
            if let Err(error) = child.kill() {
                debug!(error = ?error, "Failed to kill tool, it most likely exited already");
            }
        }
    }

    if let Err(error) = child.wait() {
        warn!(error = ?error, "Failed to reap tool");
    }
}

/// Wait for `child`, `None` if it was stopped because `abort` turned true
fn supervise(
    child: &mut Child,
    start: Instant,
    timeout: Option<Duration>,
    abort: &dyn Fn() -> bool,
) -> Result<Option<ExitStatus>, ExecutorError> {
    loop {
        match child.wait_timeout(POLL_INTERVAL) {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => {}
            Err(error) => {
                terminate(child);

                return Err(ExecutorError::Capture(error));
            }
        }

        if abort() {
            warn!("Stopping tool, the run already failed");
            terminate(child);

            return Ok(None);
        }

        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                warn!(timeout = ?limit, "Tool ran into timeout, killing it");
                terminate(child);

                return Err(ExecutorError::Timeout(limit));
            }
        }
    }
}

fn connection_args(target: &TargetConfig) -> Vec<String> {
    vec![
        "-U".to_owned(),
        target.user().to_owned(),
        "-p".to_owned(),
        target.port().to_string(),
        "-h".to_owned(),
        target.host().to_owned(),
    ]
}

impl LocalExecutor {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            probe: Box::new(|| Ok(Box::new(SysinfoProbe::new()?) as Box<dyn Probe>)),
            observer: Arc::new(Silent),
        }
    }

    /// replace the source of resource samples
    pub fn with_probe<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Probe>, MonitorError> + Send + Sync + 'static,
    {
        self.probe = Box::new(factory);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// arguments of a benchmark run, `config` has to be sanitized
    pub fn run_args(config: &RunConfig, mode: Mode) -> Vec<String> {
        let mut args = connection_args(&config.target);
        args.extend([
            "-M".to_owned(),
            "extended".to_owned(),
            "--vacuum-all".to_owned(),
            "-j".to_owned(),
            config.threads().to_string(),
            "-c".to_owned(),
            config.clients().to_string(),
            "-T".to_owned(),
            mode.parameters().duration.as_secs().to_string(),
            // the database name is expected last
            config.target.dbname().to_owned(),
        ]);

        args
    }

    /// arguments that prepare a target database, `config` has to be sanitized
    pub fn init_args(config: &InitConfig) -> Vec<String> {
        let mut args = connection_args(&config.target);
        args.extend([
            "-i".to_owned(),
            "-s".to_owned(),
            config.scale().to_string(),
            "-F".to_owned(),
            config.fill().to_string(),
            config.target.dbname().to_owned(),
        ]);

        args
    }

    /// command line as it gets recorded, the password never shows up here
    pub fn render(&self, args: &[String]) -> String {
        std::iter::once(self.tool.display().to_string())
            .chain(args.iter().cloned())
            .join(" ")
    }

    fn command(&self, args: &[String], password: Option<&str>) -> Command {
        let mut command = Command::new(&self.tool);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        if let Some(password) = password.filter(|password| !password.is_empty()) {
            command.env("PGPASSWORD", password);
        }

        command
    }

    /// Spawn `command` and collect its output, `None` if it was stopped through `abort`
    fn capture(
        &self,
        mut command: Command,
        timeout: Option<Duration>,
        abort: &dyn Fn() -> bool,
    ) -> Result<Option<RunOutput>, ExecutorError> {
        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
            tool: self.tool.display().to_string(),
            source,
        })?;
        debug!(pid = child.id(), "Spawned tool");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        thread::scope(|scope| -> Result<Option<RunOutput>, ExecutorError> {
            // both pipes are drained while waiting, a full pipe would block the child
            let stdout = scope.spawn(move || read_pipe(stdout));
            let stderr = scope.spawn(move || read_pipe(stderr));

            let status = supervise(&mut child, start, timeout, abort);

            let stdout = stdout
                .join()
                .map_err(|_| ExecutorError::Panicked("stdout reader"))??;
            let stderr = stderr
                .join()
                .map_err(|_| ExecutorError::Panicked("stderr reader"))??;

            Ok(status?.map(|status| RunOutput {
                runtime: start.elapsed(),
                stdout,
                stderr,
                status,
            }))
        })
    }

    /// Run the tool next to the resource sampler and wait until both finished
    ///
    /// Three threads take part: the child process, the sampler and the accumulator draining the
    /// sample channel. All of them are joined before this returns, the first error any of them
    /// reported wins.
    pub(crate) fn execute(
        &self,
        config: &RunConfig,
        mode: Mode,
        args: &[String],
    ) -> Result<Execution, ExecutorError> {
        let parameters = mode.parameters();
        let command = self.command(args, config.target.password.as_deref());
        let mut probe = (self.probe)()?;

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (sample_tx, sample_rx) = unbounded();
        let errors = FirstError::default();

        let (output, cpu, memory) = thread::scope(|scope| {
            let errors = &errors;

            let process = scope.spawn(move || {
                let output = match self.capture(command, config.timeout(), &|| errors.is_set()) {
                    Ok(Some(output)) if output.success() => Some(output),
                    Ok(Some(output)) => {
                        errors.record(ExecutorError::NonZeroExit {
                            status: output.status,
                            stderr: output.stderr.trim().to_owned(),
                        });

                        None
                    }
                    Ok(None) => None,
                    Err(error) => {
                        errors.record(error);

                        None
                    }
                };

                // closing the stop signal ends the sampler
                drop(stop_tx);

                output
            });

            let sampler = scope.spawn(move || {
                if let Err(error) = monitor(parameters.sampling, &stop_rx, sample_tx, &mut *probe)
                {
                    errors.record(error.into());
                }
            });

            let accumulator = scope.spawn(move || {
                let mut cpu = SampleSeries::with_capacity(parameters.expected_samples);
                let mut memory = SampleSeries::with_capacity(parameters.expected_samples);

                for sample in sample_rx {
                    cpu.push(sample.cpu);
                    memory.push(sample.memory);
                }

                (cpu, memory)
            });

            let output = process.join().unwrap_or_else(|_| {
                errors.record(ExecutorError::Panicked("process"));

                None
            });
            if sampler.join().is_err() {
                errors.record(ExecutorError::Panicked("sampler"));
            }
            let (cpu, memory) = accumulator.join().unwrap_or_else(|_| {
                errors.record(ExecutorError::Panicked("accumulator"));

                Default::default()
            });

            (output, cpu, memory)
        });

        if let Some(error) = errors.into_inner() {
            return Err(error);
        }
        let output = output.ok_or(ExecutorError::Panicked("process"))?;

        trace!(stdout = output.stdout, "Tool output");
        debug!(
            runtime = ?output.runtime,
            samples = cpu.len(),
            "Tool finished"
        );

        Ok(Execution {
            output,
            cpu,
            memory,
        })
    }

    /// Prepare the target database for benchmarking
    #[instrument(skip_all, level = "info")]
    pub fn init(&self, config: &InitConfig) -> Result<RunOutput, ExecutorError> {
        let mut config = config.clone();
        config.sanitize();

        let args = Self::init_args(&config);
        self.observer.notify(&Event::InitStarted {
            command: self.render(&args),
        });

        let command = self.command(&args, config.target.password.as_deref());
        let output = self
            .capture(command, None, &|| false)?
            .ok_or(ExecutorError::Panicked("process"))?;

        if !output.success() {
            return Err(ExecutorError::NonZeroExit {
                status: output.status,
                stderr: output.stderr.trim().to_owned(),
            });
        }

        info!(runtime = ?output.runtime, "Initialized target database");
        self.observer.notify(&Event::InitFinished {
            runtime: output.runtime,
        });

        Ok(output)
    }
}

impl Executor for LocalExecutor {
    #[instrument(skip_all, level = "info", fields(clients = ?config.clients))]
    fn run_once(&self, config: &RunConfig) -> Result<BenchmarkBundle, ExecutorError> {
        let mut config = config.clone();
        config.sanitize();

        // unknown modes fail before anything is spawned
        let mode = config.mode()?;
        let args = Self::run_args(&config, mode);
        let command = self.render(&args);

        self.observer.notify(&Event::RunStarted {
            clients: config.clients(),
            command: command.clone(),
        });

        let recorded_at = Utc::now();
        let execution = self.execute(&config, mode, &args)?;

        if execution.cpu.is_empty() {
            return Err(ExecutorError::NoSamples);
        }

        let report = pgbench::parse(&execution.output.stdout)?;

        self.observer.notify(&Event::RunFinished {
            clients: config.clients(),
            runtime: execution.output.runtime,
            samples: execution.cpu.len(),
        });

        Ok(BenchmarkBundle {
            group_id: None,
            comment: config.comment.filter(|comment| !comment.is_empty()),
            version: report.version,
            command,
            transaction_type: report.transaction_type,
            scaling_factor: report.scaling_factor,
            query_mode: report.query_mode,
            clients: report.clients,
            threads: report.threads,
            recorded_at,
            result: BenchmarkResult {
                id: None,
                transactions: report.transactions,
                failed_transactions: report.failed_transactions,
                transactions_per_second: report.transactions_per_second,
                average_latency: report.average_latency,
                connection_time: report.connection_time,
                total_runtime: execution.output.runtime,
            },
            system_metric: SystemMetric {
                id: None,
                cpu: execution.cpu.summary(),
                memory: execution.memory.summary(),
            },
            system_config: None,
        })
    }
}

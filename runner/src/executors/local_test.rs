use crate::{
    config::{ConfigErrors, InitConfig, Mode, RunConfig, TargetConfig},
    database::{
        query::QueryOptions, sqlite::SqliteStore, BenchmarkBundle, BenchmarkResult, Store,
        SystemConfig, SystemMetric,
    },
    executors::{local::LocalExecutor, run_batch, Executor, ExecutorError},
    ingest::{pgbench_test::REPORT, IngestorError},
    monitor::{MonitorError, Probe, Sample},
    observer::{Event, Silent},
    stats::summarize,
};
use chrono::Utc;
use parking_lot::{const_mutex, Mutex};
use std::{
    fs::{self, File, Permissions},
    io::Write,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tempfile::TempDir;

// executing a script while another thread still holds a write handle to it fails with ETXTBSY
static SPAWN: Mutex<()> = const_mutex(());

struct SteadyProbe;

impl Probe for SteadyProbe {
    fn sample(&mut self) -> Result<Sample, MonitorError> {
        Ok(Sample {
            cpu: 25.0,
            memory: 50.0,
        })
    }
}

struct BrokenProbe;

impl Probe for BrokenProbe {
    fn sample(&mut self) -> Result<Sample, MonitorError> {
        Err(MonitorError::Probe {
            resource: "cpu",
            reason: "counters vanished".to_owned(),
        })
    }
}

fn script(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("pgbench");

    {
        let mut file = File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        file.sync_all().unwrap();
    }
    fs::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();

    path
}

fn executor(tool: &Path) -> LocalExecutor {
    LocalExecutor::new(tool).with_probe(|| Ok(Box::new(SteadyProbe) as Box<dyn Probe>))
}

fn report_after(seconds: &str) -> String {
    format!("sleep {seconds}\ncat <<'EOF'\n{REPORT}EOF")
}

#[test]
pub fn run_once_builds_a_bundle() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let args = dir.path().join("args");
    let tool = script(
        &dir,
        &format!(
            "echo \"$PGPASSWORD $@\" > \"{}\"\n{}",
            args.display(),
            report_after("1.5")
        ),
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    let executor = executor(&tool)
        .with_observer(Arc::new(move |event: &Event| seen.lock().push(event.clone())));

    let config = RunConfig {
        target: TargetConfig {
            password: Some("secret".to_owned()),
            ..Default::default()
        },
        threads: Some(2),
        clients: Some(8),
        comment: Some("ci".to_owned()),
        ..Default::default()
    };

    let bundle = executor.run_once(&config).unwrap();
    let expected_args = "-U postgres -p 5432 -h localhost -M extended --vacuum-all -j 2 -c 8 -T 5 postgres";

    assert_eq!(
        bundle.command,
        format!("{} {expected_args}", tool.display())
    );
    assert!(!bundle.command.contains("secret"));
    assert_eq!(
        fs::read_to_string(&args).unwrap(),
        format!("secret {expected_args}\n")
    );

    assert_eq!(bundle.group_id, None);
    assert_eq!(bundle.comment.as_deref(), Some("ci"));
    assert_eq!(bundle.version, "16.2 (Ubuntu 16.2-1.pgdg22.04+1)");
    assert_eq!(bundle.clients, 8);
    assert_eq!(bundle.threads, 2);
    assert_eq!(bundle.result.transactions, 6173);
    assert_eq!(bundle.result.transactions_per_second, 1234.56);
    assert_eq!(bundle.result.average_latency, Duration::from_micros(5359));
    assert!(bundle.result.total_runtime >= Duration::from_millis(1500));
    assert_eq!(bundle.system_metric.cpu, summarize(&[25.0]));
    assert_eq!(bundle.system_metric.memory.max, 50.0);
    assert_eq!(bundle.system_config, None);

    let events = events.lock();
    assert!(matches!(events.first(), Some(Event::RunStarted { clients: 8, .. })));
    assert!(matches!(events.last(), Some(Event::RunFinished { clients: 8, .. })));
}

#[test]
pub fn sample_streams_stay_aligned() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let tool = script(&dir, &report_after("2.5"));

    let mut config = RunConfig::default();
    config.sanitize();
    let args = LocalExecutor::run_args(&config, Mode::Simple);

    let execution = executor(&tool)
        .execute(&config, Mode::Simple, &args)
        .unwrap();

    assert!(execution.output.success());
    assert!(!execution.cpu.is_empty());
    assert_eq!(execution.cpu.len(), execution.memory.len());
}

#[test]
pub fn non_zero_exit_keeps_stderr() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let tool = script(&dir, "echo 'connection to server failed' >&2\nexit 2");

    match executor(&tool).run_once(&RunConfig::default()) {
        Err(ExecutorError::NonZeroExit { status, stderr }) => {
            assert_eq!(status.code(), Some(2));
            assert_eq!(stderr, "connection to server failed");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
pub fn unknown_mode_spawns_nothing() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("spawned");
    let tool = script(&dir, &format!("touch \"{}\"", marker.display()));

    let config = RunConfig {
        mode: Some("turbo".to_owned()),
        ..Default::default()
    };

    assert!(matches!(
        executor(&tool).run_once(&config),
        Err(ExecutorError::Config(ConfigErrors::UnknownMode(mode))) if mode == "turbo"
    ));
    assert!(!marker.exists());
}

#[test]
pub fn unparsable_output_fails_the_run() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let tool = script(&dir, "sleep 1.5\necho 'number of clients: many'");

    assert!(matches!(
        executor(&tool).run_once(&RunConfig::default()),
        Err(ExecutorError::Ingest(IngestorError::InvalidInteger {
            field: "number of clients",
            ..
        }))
    ));
}

#[test]
pub fn silent_tool_fails_the_run() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let tool = script(&dir, "sleep 1.5");

    assert!(matches!(
        executor(&tool).run_once(&RunConfig::default()),
        Err(ExecutorError::Ingest(IngestorError::MissingField(_)))
    ));
}

#[test]
pub fn run_without_samples_is_rejected() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let tool = script(&dir, &report_after("0"));

    assert!(matches!(
        executor(&tool).run_once(&RunConfig::default()),
        Err(ExecutorError::NoSamples)
    ));
}

#[test]
pub fn deadline_kills_the_tool() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let tool = script(&dir, "exec sleep 10");

    let config = RunConfig {
        timeout: Some(1),
        ..Default::default()
    };

    let start = Instant::now();
    assert!(matches!(
        executor(&tool).run_once(&config),
        Err(ExecutorError::Timeout(limit)) if limit == Duration::from_secs(1)
    ));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
pub fn deadline_kills_forked_helpers() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    // the shell forks, `sleep` inherits both pipes
    let tool = script(&dir, "sleep 10\necho done");

    let config = RunConfig {
        timeout: Some(1),
        ..Default::default()
    };

    let start = Instant::now();
    assert!(matches!(
        executor(&tool).run_once(&config),
        Err(ExecutorError::Timeout(limit)) if limit == Duration::from_secs(1)
    ));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
pub fn sampler_failure_kills_forked_helpers() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let tool = script(&dir, "sleep 10 &\nwait");
    let executor =
        LocalExecutor::new(&tool).with_probe(|| Ok(Box::new(BrokenProbe) as Box<dyn Probe>));

    let start = Instant::now();
    assert!(matches!(
        executor.run_once(&RunConfig::default()),
        Err(ExecutorError::Monitor(_))
    ));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
pub fn probe_failure_fails_the_run() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let tool = script(&dir, "exec sleep 10");
    let executor =
        LocalExecutor::new(&tool).with_probe(|| Ok(Box::new(BrokenProbe) as Box<dyn Probe>));

    let start = Instant::now();
    assert!(matches!(
        executor.run_once(&RunConfig::default()),
        Err(ExecutorError::Monitor(MonitorError::Probe {
            resource: "cpu",
            ..
        }))
    ));
    // the tool is stopped once the sampler gave up
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
pub fn unsupported_probe_spawns_nothing() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("spawned");
    let tool = script(&dir, &format!("touch \"{}\"", marker.display()));
    let executor = LocalExecutor::new(&tool).with_probe(|| Err(MonitorError::Unsupported));

    assert!(matches!(
        executor.run_once(&RunConfig::default()),
        Err(ExecutorError::Monitor(MonitorError::Unsupported))
    ));
    assert!(!marker.exists());
}

#[test]
pub fn missing_tool_fails_to_spawn() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();

    assert!(matches!(
        executor(&dir.path().join("missing")).run_once(&RunConfig::default()),
        Err(ExecutorError::Spawn { .. })
    ));
}

#[test]
pub fn init_clamps_and_forwards() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let args = dir.path().join("args");
    let tool = script(
        &dir,
        &format!(
            "echo \"$@\" > \"{}\"\necho 'creating tables...' >&2",
            args.display()
        ),
    );

    let config = InitConfig {
        scale: Some(5000),
        fill: Some(5),
        ..Default::default()
    };

    let output = executor(&tool).init(&config).unwrap();
    assert!(output.success());
    assert_eq!(output.stderr, "creating tables...\n");
    assert_eq!(
        fs::read_to_string(&args).unwrap(),
        "-U postgres -p 5432 -h localhost -i -s 1000 -F 100 postgres\n"
    );
}

#[test]
pub fn init_failure_keeps_stderr() {
    let _guard = SPAWN.lock();
    let dir = TempDir::new().unwrap();
    let tool = script(&dir, "echo 'database \"postgres\" does not exist' >&2\nexit 1");

    assert!(matches!(
        executor(&tool).init(&InitConfig::default()),
        Err(ExecutorError::NonZeroExit { stderr, .. }) if stderr.contains("does not exist")
    ));
}

/// Executor that hands out canned bundles and fails for one client count
struct Canned {
    calls: Mutex<Vec<u32>>,
    fail_at: Option<u32>,
}

impl Canned {
    fn new(fail_at: Option<u32>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_at,
        }
    }
}

impl Executor for Canned {
    fn run_once(&self, config: &RunConfig) -> Result<BenchmarkBundle, ExecutorError> {
        let clients = config.clients();
        self.calls.lock().push(clients);

        if Some(clients) == self.fail_at {
            return Err(ExecutorError::NoSamples);
        }

        Ok(BenchmarkBundle {
            group_id: None,
            comment: None,
            version: "16.2".to_owned(),
            command: format!("pgbench -c {clients}"),
            transaction_type: "<builtin: select only>".to_owned(),
            scaling_factor: 1.0,
            query_mode: "extended".to_owned(),
            clients,
            threads: 1,
            recorded_at: Utc::now(),
            result: BenchmarkResult {
                id: None,
                transactions: 100,
                failed_transactions: 0,
                transactions_per_second: 20.0,
                average_latency: Duration::from_millis(3),
                connection_time: Duration::from_millis(1),
                total_runtime: Duration::ZERO,
            },
            system_metric: SystemMetric {
                id: None,
                cpu: summarize(&[10.0, 20.0]),
                memory: summarize(&[30.0]),
            },
            system_config: None,
        })
    }
}

fn store(dir: &TempDir) -> SqliteStore {
    SqliteStore::open(
        &crate::config::DatabaseConfig {
            path: dir.path().join("results.db"),
        },
        "1.0.0",
    )
    .unwrap()
}

#[test]
pub fn batch_shares_one_group() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let executor = Canned::new(None);
    let host = SystemConfig {
        machine_id: Some("b1946ac9-2d3e-5f2c-9a1b-0c4d5e6f7a8b".to_owned()),
        cpu_threads: Some(4),
        ..Default::default()
    };

    let events = Mutex::new(Vec::new());
    let observer = |event: &Event| events.lock().push(event.clone());

    let (group, saved) = run_batch(
        &executor,
        &store,
        &RunConfig::default(),
        &[1, 2, 4],
        Some(&host),
        &observer,
    )
    .unwrap();

    assert_eq!(saved.len(), 3);
    let members = store
        .fetch_by_group_ids(&[group.clone()], QueryOptions::default())
        .unwrap();
    assert_eq!(members.len(), 3);
    assert!(members.iter().all(|member| {
        member.system_config.as_ref().and_then(|c| c.machine_id.as_deref())
            == host.machine_id.as_deref()
    }));

    let events = events.into_inner();
    assert_eq!(
        events.first(),
        Some(&Event::BatchStarted {
            group: group.clone(),
            runs: 3
        })
    );
    assert_eq!(events.last(), Some(&Event::BatchFinished { group, saved: 3 }));
}

#[test]
pub fn batch_fails_fast_and_keeps_earlier_runs() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let executor = Canned::new(Some(4));

    assert!(matches!(
        run_batch(
            &executor,
            &store,
            &RunConfig::default(),
            &[1, 2, 4, 8],
            None,
            &Silent
        ),
        Err(ExecutorError::NoSamples)
    ));

    assert_eq!(*executor.calls.lock(), vec![1, 2, 4]);
    let saved = store.fetch(&QueryOptions::default()).unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0].group_id, saved[1].group_id);
}

#[test]
pub fn batch_needs_client_counts() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let executor = Canned::new(None);

    assert!(matches!(
        run_batch(&executor, &store, &RunConfig::default(), &[], None, &Silent),
        Err(ExecutorError::Config(ConfigErrors::MissingParameter("clients")))
    ));
    assert!(executor.calls.lock().is_empty());
}

pub mod local;

#[cfg(test)]
mod local_test;

use crate::{
    config::{ConfigErrors, RunConfig},
    database::{Benchmark, BenchmarkBundle, ConnectionError, Store, SystemConfig},
    id::GroupId,
    ingest::IngestorError,
    monitor::MonitorError,
    observer::{Event, Observer},
};
use std::{
    io,
    process::ExitStatus,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{error, info, instrument};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("failed to spawn {tool}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to capture tool output")]
    Capture(#[source] io::Error),
    #[error("tool exited with {status}: {stderr}")]
    NonZeroExit { status: ExitStatus, stderr: String },
    #[error("tool did not finish within {0:?}")]
    Timeout(Duration),
    #[error("failed to parse tool output")]
    Ingest(#[from] IngestorError),
    #[error("resource monitoring failed")]
    Monitor(#[from] MonitorError),
    #[error("the run finished before the first resource sample was taken")]
    NoSamples,
    #[error("failed to save benchmark")]
    Store(#[from] ConnectionError),
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

/// Something that turns a run config into a result bundle, one client count at a time
pub trait Executor {
    /// run the load generation tool once, the returned bundle is not persisted yet
    fn run_once(&self, config: &RunConfig) -> Result<BenchmarkBundle, ExecutorError>;
}

/// Run `config` once per entry in `clients` and save each result as soon as it is available
///
/// All benchmarks share one group id, which is generated before the first run. The first failing
/// iteration ends the batch, benchmarks saved by earlier iterations stay in the store.
#[instrument(skip_all, level = "info", fields(runs = clients.len()))]
pub fn run_batch<E, S>(
    executor: &E,
    store: &S,
    config: &RunConfig,
    clients: &[u32],
    system: Option<&SystemConfig>,
    observer: &dyn Observer,
) -> Result<(GroupId, Vec<Benchmark>), ExecutorError>
where
    E: Executor + ?Sized,
    S: Store + ?Sized,
{
    if clients.is_empty() {
        return Err(ConfigErrors::MissingParameter("clients").into());
    }

    let group = GroupId::new();
    let mut saved = Vec::with_capacity(clients.len());
    observer.notify(&Event::BatchStarted {
        group: group.clone(),
        runs: clients.len(),
    });

    for &count in clients {
        let mut config = config.clone();
        config.clients = Some(count);

        let start = Instant::now();
        let mut bundle = executor.run_once(&config).map_err(|error| {
            error!(group = %group, clients = count, error = %error, "Benchmark run failed");

            error
        })?;
        bundle.result.total_runtime = start.elapsed();
        bundle.group_id = Some(group.clone());
        bundle.system_config = system.cloned();

        let benchmark = store.save(bundle)?;
        observer.notify(&Event::Saved {
            id: benchmark.id.clone(),
        });
        saved.push(benchmark);
    }

    info!(group = %group, saved = saved.len(), "Finished benchmark batch");
    observer.notify(&Event::BatchFinished {
        group: group.clone(),
        saved: saved.len(),
    });

    Ok((group, saved))
}

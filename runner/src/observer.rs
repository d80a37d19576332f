//! Progress reporting, the orchestrator notifies whatever observer it was handed
use crate::id::{BenchmarkId, GroupId};
use std::{fmt, time::Duration};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    InitStarted {
        command: String,
    },
    InitFinished {
        runtime: Duration,
    },
    BatchStarted {
        group: GroupId,
        runs: usize,
    },
    RunStarted {
        clients: u32,
        command: String,
    },
    RunFinished {
        clients: u32,
        runtime: Duration,
        samples: usize,
    },
    Saved {
        id: BenchmarkId,
    },
    BatchFinished {
        group: GroupId,
        saved: usize,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitStarted { command } => write!(f, "initializing: {command}"),
            Self::InitFinished { runtime } => write!(f, "initialized in {runtime:.2?}"),
            Self::BatchStarted { group, runs } => write!(f, "starting {group} with {runs} runs"),
            Self::RunStarted { clients, command } => {
                write!(f, "running with {clients} clients: {command}")
            }
            Self::RunFinished {
                clients,
                runtime,
                samples,
            } => write!(
                f,
                "finished {clients} clients in {runtime:.2?} ({samples} samples)"
            ),
            Self::Saved { id } => write!(f, "saved {id}"),
            Self::BatchFinished { group, saved } => write!(f, "finished {group}, saved {saved}"),
        }
    }
}

pub trait Observer: Send + Sync {
    fn notify(&self, event: &Event);
}

impl<F> Observer for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn notify(&self, event: &Event) {
        self(event)
    }
}

/// Forwards every event to the `tracing` subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn notify(&self, event: &Event) {
        info!("{event}");
    }
}

/// Drops every event
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl Observer for Silent {
    fn notify(&self, _event: &Event) {}
}

pub mod pgbench;


use std::{
    num::{ParseFloatError, ParseIntError},
    process::ExitStatus,
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestorError {
    #[error("line for {field} is missing token {index}: {line:?}")]
    MissingToken {
        field: &'static str,
        index: usize,
        line: String,
    },
    #[error("failed to parse {field}")]
    InvalidInteger {
        field: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("failed to parse {field}")]
    InvalidFloat {
        field: &'static str,
        #[source]
        source: ParseFloatError,
    },
    #[error("{field} carries unknown duration unit {unit:?}")]
    UnknownUnit { field: &'static str, unit: String },
    #[error("{field} is not a valid duration: {value}")]
    InvalidDuration { field: &'static str, value: f64 },
    #[error("report has no {0} line")]
    MissingField(&'static str),
}

#[derive(Debug, Clone)]
/// container for information extracted from running the load generation tool
/// supposed to be interpreted by ingestors
pub struct RunOutput {
    pub runtime: Duration,
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

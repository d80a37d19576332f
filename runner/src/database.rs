pub mod migrate;
pub mod query;
pub mod sqlite;


use crate::{
    id::{BenchmarkId, GroupId, ResultId, SystemConfigId, SystemMetricId},
    stats::Summary,
};
use chrono::{DateTime, Utc};
use query::{Filter, QueryOptions};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to {step}")]
    Query {
        step: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to acquire a database connection")]
    Pool(#[from] r2d2::Error),
    // the original error stays first, the rollback failure is appended
    #[error("{source}: rollback failed: {rollback}")]
    Rollback {
        source: Box<ConnectionError>,
        rollback: rusqlite::Error,
    },
    #[error("benchmark has no group assigned")]
    MissingGroup,
    #[error("no {0} IDs provided")]
    NoIds(&'static str),
    #[error("invalid {which} version {version:?}")]
    InvalidVersion {
        which: &'static str,
        version: String,
        #[source]
        source: semver::Error,
    },
}

/// attach the failing step to a sqlite error
pub(crate) trait StepContext<T> {
    fn step(self, step: &'static str) -> Result<T, ConnectionError>;
}

impl<T> StepContext<T> for rusqlite::Result<T> {
    fn step(self, step: &'static str) -> Result<T, ConnectionError> {
        self.map_err(|source| ConnectionError::Query { step, source })
    }
}

/// Outcome of one run as reported by the load generation tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// assigned when persisted
    pub id: Option<ResultId>,
    pub transactions: u64,
    pub failed_transactions: u64,
    pub transactions_per_second: f64,
    pub average_latency: Duration,
    pub connection_time: Duration,
    pub total_runtime: Duration,
}

/// Host utilization observed during one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetric {
    pub id: Option<SystemMetricId>,
    pub cpu: Summary,
    pub memory: Summary,
}

/// Description of the host a benchmark ran on, every field is best effort
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub id: Option<SystemConfigId>,
    pub machine_id: Option<String>,
    pub os_name: Option<String>,
    pub os_arch: Option<String>,
    // in case of a multi-cpu system, vendor and model of the first cpu
    pub cpu_vendor: Option<String>,
    pub cpu_model: Option<String>,
    pub cpu_count: Option<u32>,
    pub cpu_cores: Option<u32>,
    pub cpu_threads: Option<u32>,
    pub ram_physical: Option<u64>,
    pub ram_usable: Option<u64>,
    pub disk_count: Option<u32>,
    pub disk_space_total: Option<u64>,
}

/// A persisted benchmark with all of its children attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub id: BenchmarkId,
    pub group_id: GroupId,
    pub comment: Option<String>,
    pub version: String,
    pub command: String,
    pub transaction_type: String,
    pub scaling_factor: f64,
    pub query_mode: String,
    pub clients: u32,
    pub threads: u32,
    pub recorded_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub result: Option<BenchmarkResult>,
    pub system_metric: Option<SystemMetric>,
    pub system_config: Option<SystemConfig>,
}

/// Hand-off between the orchestrator and the store, the only shape `Store::save` accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkBundle {
    /// set once per batch before the first member is saved
    pub group_id: Option<GroupId>,
    pub comment: Option<String>,
    pub version: String,
    pub command: String,
    pub transaction_type: String,
    pub scaling_factor: f64,
    pub query_mode: String,
    pub clients: u32,
    pub threads: u32,
    pub recorded_at: DateTime<Utc>,
    pub result: BenchmarkResult,
    pub system_metric: SystemMetric,
    pub system_config: Option<SystemConfig>,
}

/// Persistence of benchmark bundles
pub trait Store {
    /// persist one bundle atomically, either all rows are written or none
    fn save(&self, bundle: BenchmarkBundle) -> Result<Benchmark, ConnectionError>;

    /// persist all bundles in a single transaction, the first failure aborts the batch
    fn save_many(&self, bundles: Vec<BenchmarkBundle>) -> Result<Vec<Benchmark>, ConnectionError>;

    fn fetch(&self, options: &QueryOptions) -> Result<Vec<Benchmark>, ConnectionError>;

    fn fetch_group_ids(&self, options: &QueryOptions) -> Result<Vec<GroupId>, ConnectionError>;

    fn count(&self, options: &QueryOptions) -> Result<u64, ConnectionError>;

    /// number of rows over all tables
    fn count_all(&self) -> Result<u64, ConnectionError>;

    /// remove benchmarks and everything they own, returns the number of removed benchmarks
    fn remove_by_ids(&self, ids: &[BenchmarkId]) -> Result<usize, ConnectionError>;

    fn remove_by_group_ids(&self, ids: &[GroupId]) -> Result<usize, ConnectionError>;

    fn fetch_by_ids(
        &self,
        ids: &[BenchmarkId],
        options: QueryOptions,
    ) -> Result<Vec<Benchmark>, ConnectionError> {
        if ids.is_empty() {
            return Err(ConnectionError::NoIds("benchmark"));
        }

        self.fetch(&options.with_filter(Filter::Ids(ids.to_vec())))
    }

    fn fetch_by_group_ids(
        &self,
        ids: &[GroupId],
        options: QueryOptions,
    ) -> Result<Vec<Benchmark>, ConnectionError> {
        if ids.is_empty() {
            return Err(ConnectionError::NoIds("benchmark-group"));
        }

        self.fetch(&options.with_filter(Filter::GroupIds(ids.to_vec())))
    }
}

// ref: https://www.sqlite.org/lang_createtable.html
//      https://www.sqlite.org/foreignkeys.html
pub const SQL_SCHEMA: [&str; 9] = [
    "create table if not exists app_config (
    id integer primary key check (id = 1),
    version text not null
);",
    "create table if not exists benchmarks (
    id text primary key,
    group_id text not null,
    comment text,
    version text not null,
    command text not null,
    transaction_type text not null,
    scaling_factor real not null,
    query_mode text not null,
    clients integer not null,
    threads integer not null,
    recorded_at text not null,
    created_at text not null
);",
    "create index if not exists benchmarks_group_id on benchmarks (group_id);",
    "create index if not exists benchmarks_clients on benchmarks (clients);",
    "create table if not exists benchmark_results (
    id text primary key,
    benchmark_id text not null unique references benchmarks (id) on delete cascade,

    transactions integer not null check (transactions >= 0),
    failed_transactions integer not null check (failed_transactions >= 0),
    transactions_per_second real not null check (transactions_per_second >= 0),
    average_latency integer not null check (average_latency >= 0),
    connection_time integer not null check (connection_time >= 0),
    total_runtime integer not null check (total_runtime >= 0)
);",
    "create table if not exists system_metrics (
    id text primary key,
    benchmark_id text not null unique references benchmarks (id) on delete cascade,

    cpu_min_load real not null check (cpu_min_load >= 0),
    cpu_max_load real not null check (cpu_max_load >= 0),
    cpu_average_load real not null check (cpu_average_load >= 0),
    cpu_50th_load real not null check (cpu_50th_load >= 0),
    cpu_75th_load real not null check (cpu_75th_load >= 0),
    cpu_90th_load real not null check (cpu_90th_load >= 0),
    cpu_95th_load real not null check (cpu_95th_load >= 0),
    cpu_99th_load real not null check (cpu_99th_load >= 0),

    memory_min_load real not null check (memory_min_load >= 0),
    memory_max_load real not null check (memory_max_load >= 0),
    memory_average_load real not null check (memory_average_load >= 0),
    memory_50th_load real not null check (memory_50th_load >= 0),
    memory_75th_load real not null check (memory_75th_load >= 0),
    memory_90th_load real not null check (memory_90th_load >= 0),
    memory_95th_load real not null check (memory_95th_load >= 0),
    memory_99th_load real not null check (memory_99th_load >= 0)
);",
    "create table if not exists system_configs (
    id text primary key,
    benchmark_id text not null unique references benchmarks (id) on delete cascade,

    machine_id text check (machine_id <> ''),
    os_name text,
    os_arch text,
    cpu_vendor text,
    cpu_model text,
    cpu_count integer check (cpu_count > 0),
    cpu_cores integer check (cpu_cores > 0),
    cpu_threads integer check (cpu_threads > 0),
    ram_physical integer check (ram_physical > 0),
    ram_usable integer check (ram_usable > 0),
    disk_count integer check (disk_count > 0),
    disk_space_total integer check (disk_space_total > 0)
);",
    // machine_id can't be unique, it's nullable and one row exists per benchmark
    "create index if not exists system_configs_machine_id on system_configs (machine_id);",
    "create index if not exists benchmarks_recorded_at on benchmarks (recorded_at);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

/// every table that `Store::count_all` sums over
pub const TABLES: [&str; 5] = [
    "app_config",
    "benchmarks",
    "benchmark_results",
    "system_metrics",
    "system_configs",
];

use super::{
    migrate::{migrate, needs_migration, stored_version},
    query::QueryOptions,
    Benchmark, BenchmarkBundle, BenchmarkResult, ConnectionError, StepContext, Store,
    SystemConfig, SystemMetric, TABLES,
};
use crate::{
    config::DatabaseConfig,
    id::{BenchmarkId, GroupId, ResultId, SystemConfigId, SystemMetricId},
    stats::Summary,
};
use chrono::Utc;
use itertools::Itertools;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rayon::prelude::*;
use rusqlite::{
    params, params_from_iter, types::Value, Connection, Row, Transaction, TransactionBehavior,
};
use std::{path::PathBuf, time::Duration};
use tracing::{debug, error, info, instrument, warn};

/// Child tables, each row is owned by exactly one benchmark
const CHILD_TABLES: [&str; 3] = ["benchmark_results", "system_metrics", "system_configs"];

const SELECT_BENCHMARKS: &str = "select
    b.id, b.group_id, b.comment, b.version, b.command, b.transaction_type, b.scaling_factor,
    b.query_mode, b.clients, b.threads, b.recorded_at, b.created_at,

    r.id as r_id, r.transactions, r.failed_transactions, r.transactions_per_second,
    r.average_latency, r.connection_time, r.total_runtime,

    m.id as m_id,
    m.cpu_min_load, m.cpu_max_load, m.cpu_average_load, m.cpu_50th_load, m.cpu_75th_load,
    m.cpu_90th_load, m.cpu_95th_load, m.cpu_99th_load,
    m.memory_min_load, m.memory_max_load, m.memory_average_load, m.memory_50th_load,
    m.memory_75th_load, m.memory_90th_load, m.memory_95th_load, m.memory_99th_load,

    c.id as c_id, c.machine_id, c.os_name, c.os_arch, c.cpu_vendor, c.cpu_model, c.cpu_count,
    c.cpu_cores, c.cpu_threads, c.ram_physical, c.ram_usable, c.disk_count, c.disk_space_total
from benchmarks b
left join benchmark_results r on r.benchmark_id = b.id
left join system_metrics m on m.benchmark_id = b.id
left join system_configs c on c.benchmark_id = b.id";

/// Results store backed by a single SQLite file, connections are pooled so concurrent reads
/// don't serialize on one handle
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the store and bring its schema up to `app_version`
    pub fn open(config: &DatabaseConfig, app_version: &str) -> Result<Self, ConnectionError> {
        let manager = SqliteConnectionManager::file(&config.path).with_init(|connection| {
            connection.pragma_update(None, "foreign_keys", "on")?;
            connection.pragma_update(None, "busy_timeout", 10_000)?;
            connection.pragma_update_and_check(None, "journal_mode", "wal", |row| {
                row.get::<_, String>(0)
            })?;
            connection.pragma_update(None, "synchronous", "normal")
        });
        let pool = Pool::builder().max_size(8).build(manager)?;

        let mut connection = pool.get()?;
        let stored = stored_version(&connection)?;

        if needs_migration(app_version, stored.as_deref())? {
            info!(
                path = ?config.path,
                from = ?stored,
                to = app_version,
                "Migrating database"
            );
            migrate(&mut connection, app_version)?;
        } else {
            debug!(path = ?config.path, version = ?stored, "Database schema is up to date");
        }

        info!(path = ?config.path, "Opened SQLite database");

        Ok(Self {
            pool,
            path: config.path.clone(),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Number of rows in `table`, which has to be one of the store's own tables
    pub(crate) fn count_table(&self, table: &str) -> Result<u64, ConnectionError> {
        let connection = self.pool.get()?;

        connection
            .query_row(&format!("select count(*) from {table}"), [], |row| {
                row.get(0)
            })
            .step("count table rows")
    }

    /// Number of rows in the child `table` that belong to `benchmark`
    pub(crate) fn count_children(
        &self,
        table: &str,
        benchmark: &BenchmarkId,
    ) -> Result<u64, ConnectionError> {
        let connection = self.pool.get()?;

        connection
            .query_row(
                &format!("select count(*) from {table} where benchmark_id = ?"),
                params![benchmark],
                |row| row.get(0),
            )
            .step("count child rows")
    }

    fn remove_where(&self, column: &str, values: Vec<Value>) -> Result<usize, ConnectionError> {
        let placeholders = values.iter().map(|_| "?").join(", ");
        let mut connection = self.pool.get()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .step("start remove transaction")?;

        let removed = (|| {
            // cascades would do this as well, explicit deletes don't depend on the pragma
            for table in CHILD_TABLES {
                tx.execute(
                    &format!(
                        "delete from {table} where benchmark_id in
                         (select id from benchmarks where {column} in ({placeholders}))"
                    ),
                    params_from_iter(values.iter()),
                )
                .step("remove benchmark children")?;
            }

            tx.execute(
                &format!("delete from benchmarks where {column} in ({placeholders})"),
                params_from_iter(values.iter()),
            )
            .step("remove benchmarks")
        })();

        match removed {
            Ok(removed) => {
                tx.commit().step("commit remove")?;
                info!(removed = removed, "Removed benchmarks");

                Ok(removed)
            }
            Err(error) => Err(rollback(tx, error)),
        }
    }
}

/// Roll `tx` back after `error`, a failing rollback is attached to the original error
fn rollback(tx: Transaction<'_>, error: ConnectionError) -> ConnectionError {
    match tx.rollback() {
        Ok(()) => {
            warn!(error = %error, "Rolled back transaction");

            error
        }
        Err(rollback) => {
            error!(error = %error, rollback = %rollback, "Failed to roll back transaction");

            ConnectionError::Rollback {
                source: Box::new(error),
                rollback,
            }
        }
    }
}

fn nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

fn insert_bundle(tx: &Connection, bundle: BenchmarkBundle) -> Result<Benchmark, ConnectionError> {
    let group_id = bundle.group_id.ok_or(ConnectionError::MissingGroup)?;
    let id = BenchmarkId::new();
    let created_at = Utc::now();

    tx.prepare_cached(
        "insert into benchmarks
         (id, group_id, comment, version, command, transaction_type, scaling_factor, query_mode,
          clients, threads, recorded_at, created_at)
         values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .and_then(|mut statement| {
        statement.execute(params![
            id,
            group_id,
            bundle.comment,
            bundle.version,
            bundle.command,
            bundle.transaction_type,
            bundle.scaling_factor,
            bundle.query_mode,
            bundle.clients,
            bundle.threads,
            bundle.recorded_at,
            created_at
        ])
    })
    .step("save benchmark")?;

    let mut result = bundle.result;
    let result_id = ResultId::new();
    tx.prepare_cached(
        "insert into benchmark_results
         (id, benchmark_id, transactions, failed_transactions, transactions_per_second,
          average_latency, connection_time, total_runtime)
         values (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .and_then(|mut statement| {
        statement.execute(params![
            result_id,
            id,
            result.transactions,
            result.failed_transactions,
            result.transactions_per_second,
            nanos(result.average_latency),
            nanos(result.connection_time),
            nanos(result.total_runtime)
        ])
    })
    .step("save benchmark result")?;
    result.id = Some(result_id);

    let mut metric = bundle.system_metric;
    let metric_id = SystemMetricId::new();
    let (cpu, memory) = (&metric.cpu, &metric.memory);
    tx.prepare_cached(
        "insert into system_metrics
         (id, benchmark_id,
          cpu_min_load, cpu_max_load, cpu_average_load, cpu_50th_load, cpu_75th_load,
          cpu_90th_load, cpu_95th_load, cpu_99th_load,
          memory_min_load, memory_max_load, memory_average_load, memory_50th_load,
          memory_75th_load, memory_90th_load, memory_95th_load, memory_99th_load)
         values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .and_then(|mut statement| {
        statement.execute(params![
            metric_id,
            id,
            cpu.min,
            cpu.max,
            cpu.mean,
            cpu.p50,
            cpu.p75,
            cpu.p90,
            cpu.p95,
            cpu.p99,
            memory.min,
            memory.max,
            memory.mean,
            memory.p50,
            memory.p75,
            memory.p90,
            memory.p95,
            memory.p99
        ])
    })
    .step("save system metric")?;
    metric.id = Some(metric_id);

    let system_config = match bundle.system_config {
        Some(mut config) => {
            let config_id = SystemConfigId::new();
            tx.prepare_cached(
                "insert into system_configs
                 (id, benchmark_id, machine_id, os_name, os_arch, cpu_vendor, cpu_model,
                  cpu_count, cpu_cores, cpu_threads, ram_physical, ram_usable, disk_count,
                  disk_space_total)
                 values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .and_then(|mut statement| {
                statement.execute(params![
                    config_id,
                    id,
                    config.machine_id,
                    config.os_name,
                    config.os_arch,
                    config.cpu_vendor,
                    config.cpu_model,
                    config.cpu_count,
                    config.cpu_cores,
                    config.cpu_threads,
                    config.ram_physical,
                    config.ram_usable,
                    config.disk_count,
                    config.disk_space_total
                ])
            })
            .step("save system config")?;
            config.id = Some(config_id);

            Some(config)
        }
        None => None,
    };

    debug!(id = %id, group = %group_id, clients = bundle.clients, "Inserted benchmark");

    Ok(Benchmark {
        id,
        group_id,
        comment: bundle.comment,
        version: bundle.version,
        command: bundle.command,
        transaction_type: bundle.transaction_type,
        scaling_factor: bundle.scaling_factor,
        query_mode: bundle.query_mode,
        clients: bundle.clients,
        threads: bundle.threads,
        recorded_at: bundle.recorded_at,
        created_at,
        result: Some(result),
        system_metric: Some(metric),
        system_config,
    })
}

fn read_summary(row: &Row<'_>, resource: &str) -> rusqlite::Result<Summary> {
    let column = |name: &str| row.get::<_, f64>(format!("{resource}_{name}_load").as_str());

    Ok(Summary {
        min: column("min")?,
        max: column("max")?,
        mean: column("average")?,
        p50: column("50th")?,
        p75: column("75th")?,
        p90: column("90th")?,
        p95: column("95th")?,
        p99: column("99th")?,
    })
}

fn read_benchmark(row: &Row<'_>) -> rusqlite::Result<Benchmark> {
    let result = match row.get::<_, Option<ResultId>>("r_id")? {
        Some(id) => Some(BenchmarkResult {
            id: Some(id),
            transactions: row.get("transactions")?,
            failed_transactions: row.get("failed_transactions")?,
            transactions_per_second: row.get("transactions_per_second")?,
            average_latency: Duration::from_nanos(row.get("average_latency")?),
            connection_time: Duration::from_nanos(row.get("connection_time")?),
            total_runtime: Duration::from_nanos(row.get("total_runtime")?),
        }),
        None => None,
    };

    let system_metric = match row.get::<_, Option<SystemMetricId>>("m_id")? {
        Some(id) => Some(SystemMetric {
            id: Some(id),
            cpu: read_summary(row, "cpu")?,
            memory: read_summary(row, "memory")?,
        }),
        None => None,
    };

    let system_config = match row.get::<_, Option<SystemConfigId>>("c_id")? {
        Some(id) => Some(SystemConfig {
            id: Some(id),
            machine_id: row.get("machine_id")?,
            os_name: row.get("os_name")?,
            os_arch: row.get("os_arch")?,
            cpu_vendor: row.get("cpu_vendor")?,
            cpu_model: row.get("cpu_model")?,
            cpu_count: row.get("cpu_count")?,
            cpu_cores: row.get("cpu_cores")?,
            cpu_threads: row.get("cpu_threads")?,
            ram_physical: row.get("ram_physical")?,
            ram_usable: row.get("ram_usable")?,
            disk_count: row.get("disk_count")?,
            disk_space_total: row.get("disk_space_total")?,
        }),
        None => None,
    };

    Ok(Benchmark {
        id: row.get("id")?,
        group_id: row.get("group_id")?,
        comment: row.get("comment")?,
        version: row.get("version")?,
        command: row.get("command")?,
        transaction_type: row.get("transaction_type")?,
        scaling_factor: row.get("scaling_factor")?,
        query_mode: row.get("query_mode")?,
        clients: row.get("clients")?,
        threads: row.get("threads")?,
        recorded_at: row.get("recorded_at")?,
        created_at: row.get("created_at")?,
        result,
        system_metric,
        system_config,
    })
}

impl Store for SqliteStore {
    #[instrument(skip_all, level = "debug", fields(clients = bundle.clients))]
    fn save(&self, bundle: BenchmarkBundle) -> Result<Benchmark, ConnectionError> {
        let mut connection = self.pool.get()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .step("start save transaction")?;

        match insert_bundle(&tx, bundle) {
            Ok(benchmark) => {
                tx.commit().step("commit benchmark")?;
                info!(id = %benchmark.id, group = %benchmark.group_id, "Saved benchmark");

                Ok(benchmark)
            }
            Err(error) => Err(rollback(tx, error)),
        }
    }

    fn save_many(&self, bundles: Vec<BenchmarkBundle>) -> Result<Vec<Benchmark>, ConnectionError> {
        let mut connection = self.pool.get()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .step("start save transaction")?;

        let saved = bundles
            .into_iter()
            .map(|bundle| insert_bundle(&tx, bundle))
            .collect::<Result<Vec<_>, _>>();

        match saved {
            Ok(benchmarks) => {
                tx.commit().step("commit benchmarks")?;
                info!("Saved {} benchmarks", benchmarks.len());

                Ok(benchmarks)
            }
            Err(error) => Err(rollback(tx, error)),
        }
    }

    fn fetch(&self, options: &QueryOptions) -> Result<Vec<Benchmark>, ConnectionError> {
        let (filter, values) = options.where_clause();
        let sql = format!(
            "{SELECT_BENCHMARKS} {filter} {} {}",
            options.order_clause(),
            options.page_clause()
        );
        let connection = self.pool.get()?;

        let mut statement = connection.prepare_cached(&sql).step("prepare fetch")?;
        let benchmarks = statement
            .query_map(params_from_iter(values.iter()), read_benchmark)
            .step("fetch benchmarks")?
            .collect::<Result<Vec<_>, _>>()
            .step("read benchmark")?;

        debug!("Fetched {} benchmarks", benchmarks.len());

        Ok(benchmarks)
    }

    fn fetch_group_ids(&self, options: &QueryOptions) -> Result<Vec<GroupId>, ConnectionError> {
        let (filter, values) = options.where_clause();
        let sql = format!(
            "select b.group_id from benchmarks b {filter} group by b.group_id {} {}",
            options.order_clause(),
            options.page_clause()
        );
        let connection = self.pool.get()?;

        let mut statement = connection.prepare_cached(&sql).step("prepare fetch")?;
        let ids = statement
            .query_map(params_from_iter(values.iter()), |row| row.get(0))
            .step("fetch group ids")?
            .collect::<Result<Vec<GroupId>, _>>()
            .step("read group id")?;

        Ok(ids)
    }

    fn count(&self, options: &QueryOptions) -> Result<u64, ConnectionError> {
        let (filter, values) = options.where_clause();
        let connection = self.pool.get()?;

        connection
            .query_row(
                &format!("select count(*) from benchmarks b {filter}"),
                params_from_iter(values.iter()),
                |row| row.get(0),
            )
            .step("count benchmarks")
    }

    fn count_all(&self) -> Result<u64, ConnectionError> {
        // every table is counted on its own pooled connection
        TABLES
            .par_iter()
            .map(|table| self.count_table(table))
            .try_reduce(|| 0, |total, count| Ok(total + count))
    }

    fn remove_by_ids(&self, ids: &[BenchmarkId]) -> Result<usize, ConnectionError> {
        if ids.is_empty() {
            return Err(ConnectionError::NoIds("benchmark"));
        }

        self.remove_where(
            "id",
            ids.iter().map(|id| Value::Text(id.to_string())).collect(),
        )
    }

    fn remove_by_group_ids(&self, ids: &[GroupId]) -> Result<usize, ConnectionError> {
        if ids.is_empty() {
            return Err(ConnectionError::NoIds("benchmark-group"));
        }

        self.remove_where(
            "group_id",
            ids.iter().map(|id| Value::Text(id.to_string())).collect(),
        )
    }
}

use clap::{Args, Parser, Subcommand};
use once_cell::sync::Lazy;
use pgmark_runner::{
    config::{AppConfig, ConfigErrors, TargetConfig},
    database::{
        query::{parse_order, Filter, QueryOptions},
        sqlite::SqliteStore,
        Benchmark, ConnectionError, Store,
    },
    executors::{local::LocalExecutor, run_batch, ExecutorError},
    id::{BenchmarkId, GroupId, IdError},
    observer::TracingObserver,
    system,
};
use std::{
    error::Error as StdError,
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

/// version recorded in the store, release builds inject it at compile time
static APP_VERSION: Lazy<&'static str> =
    Lazy::new(|| option_env!("PGMARK_VERSION").unwrap_or(env!("CARGO_PKG_VERSION")));

#[derive(Error, Debug)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Store(#[from] ConnectionError),
    #[error(transparent)]
    Id(#[from] IdError),
}

/// Benchmark a PostgreSQL server with pgbench and keep the results
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// YAML config file, flags take precedence over its values
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// results database file
    #[arg(long)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prepare the target database for benchmarking
    Init {
        #[command(flatten)]
        target: TargetArgs,
        /// scale factor, clamped to 1..=1000
        #[arg(short, long)]
        scale: Option<u32>,
        /// fill factor, 10..=100
        #[arg(short = 'F', long)]
        fill: Option<u32>,
    },
    /// Run one benchmark per client count and store the results under a new group
    Run {
        #[command(flatten)]
        target: TargetArgs,
        /// simple or thorough
        #[arg(short, long)]
        mode: Option<String>,
        /// 0 uses every available core
        #[arg(short = 'j', long)]
        threads: Option<u32>,
        #[arg(short, long, value_delimiter = ',')]
        clients: Option<Vec<u32>>,
        #[arg(long)]
        comment: Option<String>,
        /// kill the tool after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// store a description of this host with every benchmark
        #[arg(long)]
        system_info: bool,
    },
    /// List stored benchmarks
    List {
        #[arg(short, long, value_delimiter = ',')]
        group: Vec<GroupId>,
        #[arg(short, long, value_delimiter = ',')]
        clients: Vec<u32>,
        /// columns by name or index, `-` sorts descending
        #[arg(short, long, value_delimiter = ',', allow_hyphen_values = true)]
        order: Vec<String>,
        #[arg(short, long)]
        limit: Option<u64>,
        #[arg(long)]
        offset: Option<u64>,
    },
    /// Remove benchmarks by id or whole groups
    Remove {
        #[arg(long, value_delimiter = ',')]
        ids: Vec<BenchmarkId>,
        #[arg(long, value_delimiter = ',')]
        groups: Vec<GroupId>,
    },
    /// Count stored benchmarks
    Count {
        /// count the rows of every table instead
        #[arg(long)]
        all: bool,
    },
}

#[derive(Args)]
struct TargetArgs {
    #[arg(short = 'H', long)]
    host: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(short, long)]
    dbname: Option<String>,
    #[arg(short = 'U', long)]
    user: Option<String>,
}

impl TargetArgs {
    fn apply(self, target: &mut TargetConfig) {
        if self.host.is_some() {
            target.host = self.host;
        }
        if self.port.is_some() {
            target.port = self.port;
        }
        if self.dbname.is_some() {
            target.dbname = self.dbname;
        }
        if self.user.is_some() {
            target.user = self.user;
        }
        // only ever read from the environment
        if let Ok(password) = std::env::var("PGPASSWORD") {
            target.password = Some(password);
        }
    }
}

fn print_benchmark(out: &mut impl Write, benchmark: &Benchmark) -> io::Result<()> {
    write!(
        out,
        "{} {} clients={} threads={} recorded={}",
        benchmark.id,
        benchmark.group_id,
        benchmark.clients,
        benchmark.threads,
        benchmark.recorded_at.format("%F %T")
    )?;

    if let Some(result) = &benchmark.result {
        write!(
            out,
            " tps={:.2} latency={:.3?} failed={}",
            result.transactions_per_second, result.average_latency, result.failed_transactions
        )?;
    }
    if let Some(metric) = &benchmark.system_metric {
        write!(
            out,
            " cpu={:.2}% memory={:.2}%",
            metric.cpu.mean, metric.memory.mean
        )?;
    }
    if let Some(comment) = &benchmark.comment {
        write!(out, " comment={comment:?}")?;
    }

    writeln!(out)
}

fn run(cli: Cli) -> Result<(), AppError> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(db) = cli.db {
        config.database.path = db;
    }

    let mut out = io::stdout().lock();

    match cli.command {
        Command::Init {
            target,
            scale,
            fill,
        } => {
            target.apply(&mut config.init.target);
            config.init.scale = scale.or(config.init.scale);
            config.init.fill = fill.or(config.init.fill);

            if config.preflight_checks() {
                return Err(ConfigErrors::Preflight.into());
            }

            LocalExecutor::new(&config.tool)
                .with_observer(Arc::new(TracingObserver))
                .init(&config.init)?;
        }
        Command::Run {
            target,
            mode,
            threads,
            clients,
            comment,
            timeout,
            system_info,
        } => {
            target.apply(&mut config.run.target);
            config.run.mode = mode.or(config.run.mode);
            config.run.threads = threads.or(config.run.threads);
            config.run.comment = comment.or(config.run.comment);
            config.run.timeout = timeout.or(config.run.timeout);
            if let Some(clients) = clients {
                config.clients = clients;
            }
            config.system_info |= system_info;

            if config.preflight_checks() {
                return Err(ConfigErrors::Preflight.into());
            }

            let store = SqliteStore::open(&config.database, &APP_VERSION)?;
            let host = config.system_info.then(|| system::detect().0);
            let executor =
                LocalExecutor::new(&config.tool).with_observer(Arc::new(TracingObserver));

            let (group, saved) = run_batch(
                &executor,
                &store,
                &config.run,
                &config.clients,
                host.as_ref(),
                &TracingObserver,
            )?;

            writeln!(out, "{group}").unwrap_or_log();
            for benchmark in &saved {
                print_benchmark(&mut out, benchmark).unwrap_or_log();
            }
        }
        Command::List {
            group,
            clients,
            order,
            limit,
            offset,
        } => {
            let store = SqliteStore::open(&config.database, &APP_VERSION)?;
            let mut options = QueryOptions {
                order: parse_order(&order),
                limit,
                offset,
                ..Default::default()
            };
            if !group.is_empty() {
                options = options.with_filter(Filter::GroupIds(group));
            }
            if !clients.is_empty() {
                options = options.with_filter(Filter::Clients(clients));
            }

            for benchmark in store.fetch(&options)? {
                print_benchmark(&mut out, &benchmark).unwrap_or_log();
            }
        }
        Command::Remove { ids, groups } => {
            let store = SqliteStore::open(&config.database, &APP_VERSION)?;
            let mut removed = 0;

            if ids.is_empty() && groups.is_empty() {
                warn!("Nothing to remove, pass --ids or --groups");
            }
            if !ids.is_empty() {
                removed += store.remove_by_ids(&ids)?;
            }
            if !groups.is_empty() {
                removed += store.remove_by_group_ids(&groups)?;
            }

            writeln!(out, "removed {removed} benchmarks").unwrap_or_log();
        }
        Command::Count { all } => {
            let store = SqliteStore::open(&config.database, &APP_VERSION)?;
            let count = if all {
                store.count_all()?
            } else {
                store.count(&QueryOptions::default())?
            };

            writeln!(out, "{count}").unwrap_or_log();
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    info!(version = *APP_VERSION, "Starting pgmark");

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let mut message = error.to_string();
            let mut source = error.source();
            while let Some(cause) = source {
                message.push_str(&format!(": {cause}"));
                source = cause.source();
            }
            error!("{message}");

            ExitCode::FAILURE
        }
    }
}

//! Command surface for polling a coordinator, cancelling unwanted queries and
//! logging every observed query.
//!
//! - [`run_cli`] executes a parsed [`Cli`].
//! - [`run_pipeline`] performs one poll / cancel / log pass against any
//!   [`Coordinator`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use query_reaper_coordinator::{
    CancelOutcome, Coordinator, CoordinatorConfig, HttpCoordinator, StaticCoordinator,
    DEFAULT_COORDINATOR_PORT,
};
use query_reaper_core::{flatten_record, select_targets, CancelPlan};
use query_reaper_store_sqlite::SqliteQueryLog;
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_DB_PATH: &str = "./logged_queries.sqlite";

#[derive(Debug, Parser)]
#[command(name = "query-reaper")]
#[command(about = "Cancel unwanted coordinator queries and log every observed query")]
pub struct Cli {
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_json(&self) -> bool {
        self.log_json
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll, cancel matching queries, then log the polled snapshot.
    Run(RunArgs),
    /// Poll and report which queries would be cancelled.
    Scan(ScanArgs),
    /// Read back the persisted query log.
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
}

#[derive(Debug, Args)]
pub struct SourceArgs {
    #[arg(long, required_unless_present = "snapshot", conflicts_with = "snapshot")]
    host: Option<String>,
    #[arg(long, default_value_t = DEFAULT_COORDINATOR_PORT)]
    port: u16,
    #[arg(long)]
    plain_http: bool,
    #[arg(long)]
    verify_tls: bool,
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Use a captured `/v1/query` listing instead of a live coordinator.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    #[command(flatten)]
    source: SourceArgs,
}

#[derive(Debug, Subcommand)]
pub enum LogCommand {
    List(LogListArgs),
    Show(LogShowArgs),
}

#[derive(Debug, Args)]
pub struct LogListArgs {
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct LogShowArgs {
    #[arg(long)]
    query_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunReport {
    pub polled: usize,
    pub dry_run: bool,
    pub plan: CancelPlan,
    pub cancellations: Vec<CancelOutcome>,
    pub logged: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScanReport {
    pub polled: usize,
    pub plan: CancelPlan,
}

/// Installs the stderr subscriber. `RUST_LOG` overrides the `info` default.
///
/// # Errors
/// Returns an error when a global subscriber is already installed.
pub fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|err| anyhow!("failed to initialize tracing: {err}"))
}

/// Executes the parsed top-level command.
///
/// # Errors
/// Returns an error when polling, flattening, persistence or log lookup
/// fails. Failed cancellations are reported, not raised.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let coordinator = build_coordinator(&args.source)?;
            let mut log = SqliteQueryLog::open_and_migrate(&cli.db)?;
            let report = run_pipeline(coordinator.as_ref(), &mut log, args.dry_run)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Scan(args) => {
            let coordinator = build_coordinator(&args.source)?;
            let records = coordinator.fetch_queries()?;
            let report = ScanReport {
                polled: records.len(),
                plan: select_targets(&records),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Log { command } => run_log(command, &cli.db),
    }
}

/// Runs one pass: poll, classify the whole snapshot, cancel each target in
/// turn, then upsert the snapshot as it was polled.
///
/// Every record is flattened before anything is written, so a malformed
/// record leaves the log untouched.
///
/// # Errors
/// Returns an error when the poll fails, a record cannot be flattened, or
/// the log write fails.
pub fn run_pipeline<C>(
    coordinator: &C,
    log: &mut SqliteQueryLog,
    dry_run: bool,
) -> Result<RunReport>
where
    C: Coordinator + ?Sized,
{
    let records = coordinator.fetch_queries()?;
    let plan = select_targets(&records);
    tracing::info!(
        polled = records.len(),
        targets = plan.targets.len(),
        dry_run,
        "classified coordinator snapshot"
    );

    let cancellations = if dry_run {
        Vec::new()
    } else {
        plan.targets
            .iter()
            .map(|query_id| coordinator.cancel_query(query_id))
            .collect()
    };

    let rows = records
        .iter()
        .map(flatten_record)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to flatten polled queries")?;
    let logged = log.upsert_rows(&rows)?;
    tracing::info!(logged, "logged polled queries");

    Ok(RunReport {
        polled: records.len(),
        dry_run,
        plan,
        cancellations,
        logged,
    })
}

fn build_coordinator(args: &SourceArgs) -> Result<Box<dyn Coordinator>> {
    if let Some(path) = &args.snapshot {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let payload: Value = serde_json::from_str(&raw)
            .with_context(|| format!("snapshot {} is not valid JSON", path.display()))?;
        return Ok(Box::new(StaticCoordinator::from_json(&payload)?));
    }

    let host = args
        .host
        .clone()
        .ok_or_else(|| anyhow!("--host is required unless --snapshot is given"))?;
    let config = CoordinatorConfig {
        host,
        port: args.port,
        use_tls: !args.plain_http,
        verify_tls: args.verify_tls,
        timeout_ms: args.timeout_ms,
    };
    let coordinator = HttpCoordinator::new(config)?;
    tracing::debug!(
        url = %coordinator.config().status_url(),
        verify_tls = coordinator.config().verify_tls,
        "configured coordinator endpoint"
    );
    Ok(Box::new(coordinator))
}

fn run_log(command: LogCommand, db: &Path) -> Result<()> {
    let log = SqliteQueryLog::open_and_migrate(db)?;
    match command {
        LogCommand::List(args) => {
            let rows = log.list_rows(args.state.as_deref(), args.limit)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        LogCommand::Show(args) => {
            let row = log
                .get_row(&args.query_id)?
                .ok_or_else(|| anyhow!("query not found in log: {}", args.query_id))?;
            println!("{}", serde_json::to_string_pretty(&row)?);
            Ok(())
        }
    }
}

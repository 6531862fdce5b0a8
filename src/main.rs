//! Binary entry point for the `brickwork` administrative CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use brickwork::block_sizes::{
    BlockSizeReport, BlockSizesError, FixOutcome, FixReport, check_block_sizes, fix_block_sizes,
};
use brickwork::cleaner::{
    BackgroundCleaner, CleanSummary, CleanerError, OpClass, OpTracker, OperationCleaner, Selector,
};
use brickwork::config::{ConfigError, ExecutorKind, ServiceConfig};
use brickwork::db::{Db, DbError};
use brickwork::executor::{Executor, MockExecutor, SshExecutor};
use brickwork::health::AllNodesUp;
use brickwork::operations::OperationContext;
use brickwork::pending::purge::{PurgeError, PurgePlan, delete_pending_entries, plan_purge};
use brickwork::pending::reset::mark_pending_operations_stale;
use brickwork::pending::PendingOperationEntry;

mod cli;

use cli::{BlockSizesCommand, Cli, Command, PendingCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Db(#[from] DbError),
    #[error("purge failed: {0}")]
    Purge(#[from] PurgeError),
    #[error("cleaner error: {0}")]
    Cleaner(#[from] CleanerError),
    #[error("block size check failed: {0}")]
    BlockSizes(#[from] BlockSizesError),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
    #[error("the background cleaner is disabled by configuration")]
    CleanerDisabled,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli, &mut io::stdout()).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli, out: &mut impl Write) -> Result<i32, CliError> {
    let mut config = ServiceConfig::load_without_cli_args()?;
    if let Some(path) = cli.db {
        config.db_path = path;
    }
    config.validate()?;
    init_logging(&config.log_filter);
    let db = Arc::new(Db::open(&config.db_path())?);

    match cli.command {
        Command::Pending(PendingCommand::List) => {
            let entries = db.view(|tx| tx.load_all::<PendingOperationEntry>())?;
            render_entries(out, &entries)?;
            Ok(0)
        }
        Command::Pending(PendingCommand::MarkStale) => {
            let marked = mark_pending_operations_stale(&db)?;
            writeln!(out, "marked {marked} pending operations stale")?;
            Ok(0)
        }
        Command::Pending(PendingCommand::Clean(args)) => {
            let cleaner = OperationCleaner::new(context(&config, db), executor(&config)?)
                .with_selector(Selector::from_ids(args.ids));
            let summary = cleaner.clean().await?;
            render_summary(out, summary)?;
            Ok(i32::from(summary.failed > 0))
        }
        Command::Pending(PendingCommand::Purge(args)) => {
            let plan = if args.dry_run {
                db.view(plan_purge)?
            } else {
                delete_pending_entries(&db)?
            };
            render_plan(out, &plan, args.dry_run)?;
            Ok(0)
        }
        Command::BlockSizes(BlockSizesCommand::Check) => {
            let reports = check_block_sizes(&db)?;
            render_reports(out, &reports)?;
            Ok(i32::from(reports.iter().any(|report| !report.correct)))
        }
        Command::BlockSizes(BlockSizesCommand::Fix) => {
            let fixes = fix_block_sizes(&db, config.size_fix_bounds())?;
            render_fixes(out, &fixes)?;
            Ok(i32::from(
                fixes
                    .iter()
                    .any(|fix| fix.outcome == FixOutcome::Flagged),
            ))
        }
        Command::Reaper => run_reaper(&config, db, out).await,
    }
}

fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
    {
        writeln!(io::stderr(), "failed to initialise logging: {err}").ok();
    }
}

fn context(config: &ServiceConfig, db: Arc<Db>) -> OperationContext {
    OperationContext::new(db, config.operation_settings(), Arc::new(AllNodesUp))
}

fn executor(config: &ServiceConfig) -> Result<Arc<dyn Executor>, CliError> {
    let executor: Arc<dyn Executor> = match config.executor_kind()? {
        ExecutorKind::Ssh => Arc::new(SshExecutor::with_process_runner(config.ssh_config())),
        ExecutorKind::Mock => Arc::new(MockExecutor::new()),
    };
    Ok(executor)
}

async fn run_reaper(
    config: &ServiceConfig,
    db: Arc<Db>,
    out: &mut impl Write,
) -> Result<i32, CliError> {
    if config.background_cleaner_disabled {
        return Err(CliError::CleanerDisabled);
    }
    mark_pending_operations_stale(&db)?;
    let tracker = Arc::new(OpTracker::new(config.max_inflight_operations));
    let cleaner = OperationCleaner::new(context(config, db), executor(config)?)
        .with_tracker(tracker, OpClass::Clean)
        .with_stale_age(config.stale_age());
    let handle = BackgroundCleaner::new(
        cleaner,
        config.cleaner_start_delay(),
        config.cleaner_interval(),
    )
    .start();
    writeln!(out, "reaper running, press Ctrl-C to stop")?;

    let signal = tokio::signal::ctrl_c().await;
    handle.stop().await;
    signal?;
    writeln!(out, "reaper stopped")?;
    Ok(0)
}

fn render_entries(out: &mut impl Write, entries: &[PendingOperationEntry]) -> Result<(), CliError> {
    writeln!(out, "{}", serde_json::to_string_pretty(entries)?)?;
    Ok(())
}

fn render_summary(out: &mut impl Write, summary: CleanSummary) -> io::Result<()> {
    writeln!(
        out,
        "cleaned {}, failed {}, throttled {}, skipped {}",
        summary.cleaned, summary.failed, summary.throttled, summary.skipped
    )
}

fn render_plan(out: &mut impl Write, plan: &PurgePlan, dry_run: bool) -> io::Result<()> {
    let verb = if dry_run { "would remove" } else { "removed" };
    writeln!(
        out,
        "{verb} {} operations, {} volumes, {} block volumes, {} bricks; {} entities released",
        plan.operations.len(),
        plan.volumes.len(),
        plan.block_volumes.len(),
        plan.bricks.len(),
        plan.released.len()
    )?;
    for id in &plan.operations {
        writeln!(out, "  operation {id}")?;
    }
    Ok(())
}

fn render_report(out: &mut impl Write, report: &BlockSizeReport, verdict: &str) -> io::Result<()> {
    writeln!(
        out,
        "{} ({}): size={} used={} free={} reserved={} {verdict}",
        report.name, report.volume, report.size, report.used, report.free, report.reserved
    )
}

fn render_reports(out: &mut impl Write, reports: &[BlockSizeReport]) -> io::Result<()> {
    if reports.is_empty() {
        return writeln!(out, "no block-hosting volumes");
    }
    for report in reports {
        let verdict = if report.correct { "ok" } else { "MISMATCH" };
        render_report(out, report, verdict)?;
    }
    Ok(())
}

fn render_fixes(out: &mut impl Write, fixes: &[FixReport]) -> io::Result<()> {
    if fixes.is_empty() {
        return writeln!(out, "no block-hosting volumes");
    }
    for fix in fixes {
        let verdict = match fix.outcome {
            FixOutcome::Correct => String::from("ok"),
            FixOutcome::Fixed { from, to } => format!("fixed free {from} -> {to}"),
            FixOutcome::Flagged => String::from("FLAGGED"),
        };
        render_report(out, &fix.before, &verdict)?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;

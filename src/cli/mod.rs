//! Command-line interface definitions for the `brickwork` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `brickwork` binary.
#[derive(Debug, Parser)]
#[command(
    name = "brickwork",
    about = "Inspect and repair the pending operations of a storage control plane",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Store directory to operate on, overriding `db_path` from configuration.
    #[arg(long, global = true, value_name = "PATH")]
    pub(crate) db: Option<String>,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `brickwork`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Inspect and recover pending operations.
    #[command(name = "pending", subcommand)]
    Pending(PendingCommand),
    /// Check or fix block-hosting volume budgets.
    #[command(name = "block-sizes", subcommand)]
    BlockSizes(BlockSizesCommand),
    /// Run the background cleaner until interrupted.
    #[command(name = "reaper")]
    Reaper,
}

/// Subcommands of `brickwork pending`.
#[derive(Debug, Subcommand)]
pub(crate) enum PendingCommand {
    /// List ledger entries with their type, status and actions.
    #[command(name = "list")]
    List,
    /// Mark every running entry stale, as a service restart would.
    #[command(name = "mark-stale")]
    MarkStale,
    /// Replay cleanup for stale and failed entries.
    #[command(name = "clean")]
    Clean(CleanArgs),
    /// Delete every pending entry and what it left behind, without touching
    /// storage hosts.
    #[command(name = "purge")]
    Purge(PurgeArgs),
}

/// Arguments for `brickwork pending clean`.
#[derive(Debug, Args)]
pub(crate) struct CleanArgs {
    /// Only clean these entries. Repeat to select several.
    #[arg(long = "id", value_name = "ID")]
    pub(crate) ids: Vec<String>,
}

/// Arguments for `brickwork pending purge`.
#[derive(Debug, Args)]
pub(crate) struct PurgeArgs {
    /// Show what would be removed without changing the store.
    #[arg(long)]
    pub(crate) dry_run: bool,
}

/// Subcommands of `brickwork block-sizes`.
#[derive(Debug, Subcommand)]
pub(crate) enum BlockSizesCommand {
    /// Report the budget of every block-hosting volume.
    #[command(name = "check")]
    Check,
    /// Correct small budget errors and flag the rest.
    #[command(name = "fix")]
    Fix,
}

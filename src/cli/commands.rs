//! CLI commands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Segstore CLI
#[derive(Parser)]
#[command(name = "segstore")]
#[command(about = "Segmented append-only event store")]
pub struct Cli {
    /// Root directory holding all storage contexts
    #[arg(long, default_value = "./storage")]
    pub storage_root: PathBuf,

    /// Context to operate on
    #[arg(long, default_value = "default")]
    pub context: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print store statistics as JSON
    Stats,
    /// Validate segments and indices, rebuilding stale indices
    Validate {
        /// Restrict validation to the newest N segments
        #[arg(long)]
        segments: Option<usize>,
    },
    /// Print the token of the first event at or after an instant
    TokenAt {
        /// Milliseconds since the Unix epoch
        #[arg(long)]
        instant: i64,
    },
}

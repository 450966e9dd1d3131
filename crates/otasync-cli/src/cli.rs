// Argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// otasync - keep the OTA update list in sync
#[derive(Parser, Debug)]
#[command(name = "otasync")]
#[command(bin_name = "otasync")]
#[command(about = "Synchronize the OTA update manifest and manage known updates")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: platform config dir)
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Minimize output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Fetch the manifest once and merge it
    Check,

    /// List known updates, newest first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Import a local update package
    Import {
        /// Package to import
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Show last check, manifest digest and schedule
    Status,

    /// Run scheduled checks until interrupted
    Watch,
}

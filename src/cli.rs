//! CLI argument definitions using clap with subcommand architecture

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Parse lifecycle coordinator for VBA-style module projects
#[derive(Parser, Debug)]
#[command(name = "parser-state")]
#[command(about = "Parse a module project and track the validity of its declaration index")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (applies to all commands)
    #[arg(short, long, default_value = "text", value_enum, global = true)]
    pub format: OutputFormat,

    /// Show verbose output (debug logging)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one parse pass over a project directory and report the result
    #[command(visible_alias = "p")]
    Parse(ParseArgs),

    /// Keep the project parsed while files change, streaming events
    #[command(visible_alias = "w")]
    Watch(WatchArgs),
}

/// Arguments for `parse`
#[derive(Args, Debug)]
pub struct ParseArgs {
    /// Project directory
    pub dir: PathBuf,

    /// Module extensions to include (overrides config)
    #[arg(long, value_delimiter = ',')]
    pub ext: Vec<String>,

    /// List every declaration instead of a per-module summary
    #[arg(long)]
    pub declarations: bool,
}

/// Arguments for `watch`
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Project directory
    pub dir: PathBuf,

    /// Module extensions to watch (overrides config)
    #[arg(long, value_delimiter = ',')]
    pub ext: Vec<String>,

    /// Stop after this many seconds (runs until interrupted if omitted)
    #[arg(long)]
    pub duration: Option<u64>,
}

/// Output format
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON for machine parsing
    Json,
}

// ============================================================================
// Tests
// ============================================================================

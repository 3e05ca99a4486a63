//! Command handlers for the parser-state CLI
//!
//! - `parse` - one inline pass over a project directory
//! - `watch` - background passes driven by a file watcher
//!
//! Handlers take their `Args` struct from `cli.rs` and a shared
//! [`CommandContext`].

pub mod parse;
pub mod watch;

pub use parse::run_parse;
pub use watch::run_watch;

use std::path::Path;

use crate::cli::OutputFormat;
use crate::config::ParserStateConfig;
use crate::project::DirectoryProject;

/// Shared context passed to all command handlers
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    pub format: OutputFormat,
    pub verbose: bool,
    pub config: ParserStateConfig,
}

impl CommandContext {
    pub fn new(format: OutputFormat, verbose: bool, config: ParserStateConfig) -> Self {
        Self {
            format,
            verbose,
            config,
        }
    }

    /// Directory project honoring `--ext` over the configured extensions
    pub fn project(&self, dir: &Path, ext: &[String]) -> DirectoryProject {
        let extensions = if ext.is_empty() {
            self.config.watcher.extensions.clone()
        } else {
            ext.to_vec()
        };
        DirectoryProject::new(dir.to_path_buf()).with_extensions(extensions)
    }
}

/// What a command prints and how the process exits
#[derive(Debug)]
pub struct CommandOutput {
    pub text: String,
    /// Process exit status (0 on success)
    pub exit_status: u8,
}

impl CommandOutput {
    pub fn success(text: String) -> Self {
        Self {
            text,
            exit_status: 0,
        }
    }
}

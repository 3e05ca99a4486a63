//! parser-state configuration
//!
//! Loaded from a TOML file; every section and field is optional:
//!
//! ```toml
//! [coordinator]
//! execution = "background"   # or "inline"
//! parallel_syntax = true
//!
//! [watcher]
//! debounce_ms = 200
//! extensions = ["bas", "cls", "frm"]
//!
//! [logging]
//! level = "debug"
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ParserStateError, Result};
use crate::project::default_extensions;

/// Where parse passes run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// On the thread that raised the request; `on_parse_requested` returns
    /// after the pass
    #[default]
    Inline,
    /// On a dedicated worker thread
    Background,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParserStateConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduler settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub execution: ExecutionMode,

    /// Build syntax trees for several modules at once
    #[serde(default)]
    pub parallel_syntax: bool,
}

impl CoordinatorConfig {
    pub fn inline() -> Self {
        Self::default()
    }

    pub fn background() -> Self {
        Self {
            execution: ExecutionMode::Background,
            ..Self::default()
        }
    }

    pub fn with_parallel_syntax(mut self, parallel: bool) -> Self {
        self.parallel_syntax = parallel;
        self
    }
}

/// File watcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Module source extensions to watch (without the dot)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_debounce_ms() -> u64 {
    100
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            extensions: default_extensions(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ParserStateConfig {
    /// Load configuration from an explicitly named file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(ParserStateError::ConfigError {
                message: format!("Config file not found: {}", path.display()),
            });
        }

        let content = fs::read_to_string(path)?;
        tracing::debug!("Loaded config from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ParserStateError::ConfigError {
            message: format!("Failed to parse config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ParserStateError::ConfigError {
            message: format!("Failed to serialize config: {}", e),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.watcher.extensions.iter().any(|e| e.trim().is_empty()) {
            return Err(ParserStateError::ConfigError {
                message: "watcher.extensions contains an empty entry".to_string(),
            });
        }
        if self.watcher.debounce_ms == 0 {
            return Err(ParserStateError::ConfigError {
                message: "watcher.debounce_ms must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Error types and exit codes for parser-state

use std::process::ExitCode;
use thiserror::Error;

use crate::project::ModuleId;
use crate::status::ParseStatus;

/// Main error type for parser-state operations
#[derive(Error, Debug)]
pub enum ParserStateError {
    /// A suspension was requested while another one is active
    #[error("Parser is already suspended by {holder}")]
    BusyConflict { holder: String },

    /// A suspension was requested while a parse pass is executing
    #[error("Cannot suspend the parser while a parse pass is in flight")]
    PassInFlight,

    /// A caller asked for a status change the machine never allows
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: ParseStatus, to: ParseStatus },

    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("Module source unavailable: {message}")]
    ModuleSource { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Watcher error: {message}")]
    WatcherError { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParserStateError {
    /// Process exit status for this error:
    /// - 1: IO / module source / watcher
    /// - 2: configuration
    /// - 3: syntax error
    /// - 4: resolution error
    /// - 5: suspension / transition rejected
    pub fn exit_status(&self) -> u8 {
        match self {
            Self::Io(_) | Self::ModuleSource { .. } | Self::WatcherError { .. } => 1,
            Self::ConfigError { .. } => 2,
            Self::Syntax(_) => 3,
            Self::Resolution(_) => 4,
            Self::BusyConflict { .. } | Self::PassInFlight | Self::InvalidTransition { .. } => 5,
        }
    }

    /// Convert error to an exit code
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }

    /// Whether retrying the same call later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BusyConflict { .. } | Self::PassInFlight)
    }
}

/// One module failed to build a syntax tree
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Syntax error in {module}{}: {message}", .line.map(|l| format!(" at line {}", l)).unwrap_or_default())]
pub struct SyntaxError {
    pub module: ModuleId,
    pub line: Option<usize>,
    pub message: String,
}

impl SyntaxError {
    pub fn new(module: ModuleId, message: impl Into<String>) -> Self {
        Self {
            module,
            line: None,
            message: message.into(),
        }
    }

    pub fn at_line(module: ModuleId, line: usize, message: impl Into<String>) -> Self {
        Self {
            module,
            line: Some(line),
            message: message.into(),
        }
    }
}

/// Project-wide resolution failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Resolution failed{}: {message}", .module.as_ref().map(|m| format!(" in {}", m)).unwrap_or_default())]
pub struct ResolutionError {
    pub module: Option<ModuleId>,
    pub message: String,
}

impl ResolutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            module: None,
            message: message.into(),
        }
    }

    pub fn in_module(module: ModuleId, message: impl Into<String>) -> Self {
        Self {
            module: Some(module),
            message: message.into(),
        }
    }
}

/// Failure of [`crate::ParserStateCoordinator::suspend_parser`]
///
/// Either the suspension was never granted (`Rejected`, the action did not
/// run) or the action itself returned an error after which the suspension
/// was released normally.
#[derive(Error, Debug)]
pub enum SuspendError<E> {
    #[error(transparent)]
    Rejected(#[from] ParserStateError),

    #[error("Suspended action failed: {0}")]
    Action(E),
}

impl<E> SuspendError<E> {
    /// The rejection reason, if the action never ran
    pub fn rejection(&self) -> Option<&ParserStateError> {
        match self {
            Self::Rejected(e) => Some(e),
            Self::Action(_) => None,
        }
    }

    pub fn is_busy_conflict(&self) -> bool {
        matches!(self, Self::Rejected(ParserStateError::BusyConflict { .. }))
    }
}

/// Result type alias for parser-state operations
pub type Result<T> = std::result::Result<T, ParserStateError>;

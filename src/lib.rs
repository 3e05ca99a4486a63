//! parser-state: parse lifecycle coordination for module projects
//!
//! Tracks whether the declaration index of a VBA-style project is currently
//! valid, schedules reparses as edits arrive, and lets a caller suspend the
//! parser for an exclusive mutation window (e.g. a rename refactor).
//!
//! # Components
//!
//! - [`ParserStateCoordinator`] - public entry point
//! - [`StateMachine`] - per-module and aggregate [`ParseStatus`], transition
//!   validation, atomic index publishing
//! - [`ParseScheduler`] - request coalescing and pipeline stages
//! - [`SuspensionGate`] - the single exclusive suspension
//! - [`NotificationBus`] - ordered `StateChanged` fan-out
//! - [`ResolutionPipeline`] - syntax/resolution seam; [`LineScanPipeline`]
//!   is the bundled implementation
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use parser_state::{
//!     Actor, CoordinatorConfig, InMemoryProject, LineScanPipeline, ParserStateCoordinator,
//! };
//!
//! let project = InMemoryProject::new().with_module("Module1", "Sub Foo()\nEnd Sub\n");
//! let coordinator = ParserStateCoordinator::new(
//!     LineScanPipeline::new(),
//!     Arc::new(project.clone()),
//!     &CoordinatorConfig::inline(),
//! )?;
//!
//! coordinator.on_parse_requested(&Actor::new("editor"));
//! let index = coordinator.current_index();
//!
//! coordinator.suspend_parser(&Actor::new("rename"), |_token| {
//!     project.set_text(&"Module1".into(), "Sub Bar()\nEnd Sub\n");
//!     coordinator.on_modules_changed(&Actor::new("rename"), ["Module1".into()]);
//!     Ok::<_, anyhow::Error>(())
//! })?;
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod declarations;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod project;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod suspension;
pub mod tree_cache;
pub mod watcher;

// Re-export commonly used types
pub use cli::{Cli, OutputFormat};
pub use config::{CoordinatorConfig, ExecutionMode, ParserStateConfig, WatcherConfig};
pub use coordinator::ParserStateCoordinator;
pub use declarations::{
    Accessibility, Declaration, DeclarationIndex, DeclarationIndexBuilder, DeclarationKind,
    IdentifierReference, QualifiedName,
};
pub use error::{ParserStateError, ResolutionError, Result, SuspendError, SyntaxError};
pub use events::{
    Actor, DispatchReport, EngineEvent, EventEmitter, NotificationBus, PassCompletedEvent,
    StateChangedEvent, StateListener, SubscriptionId,
};
pub use pipeline::{LineScanPipeline, ProjectSyntax, ResolutionPipeline};
pub use project::{DirectoryProject, InMemoryProject, ModuleId, ModuleKind, ModuleProvider, SourceModule};
pub use scheduler::{ParseRequestOutcome, ParseScheduler, PassSummary, SchedulerStats};
pub use state::{PassFailure, StateMachine};
pub use status::ParseStatus;
pub use suspension::{ReleaseOutcome, SuspensionGate, SuspensionToken};
pub use watcher::{ModuleWatcher, WatcherHandle};

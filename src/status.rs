//! Parser lifecycle status and the transition table
//!
//! # Status Lifecycle
//!
//! ```text
//!             edits observed
//!   Ready ──────────────────> Pending
//!     │                          │
//!     └──────────┬───────────────┘
//!                ▼
//!             Parsing ──> ResolvingDeclarations ──> ResolvingReferences ──> Ready
//!
//!   any ──> Error                     (pipeline failure)
//!   any non-Busy ──> Busy ──> prior   (suspension, gate only)
//! ```
//!
//! # Aggregation
//!
//! The project status is the worst module status. Severity, worst first:
//! `Error > Busy > Parsing > ResolvingDeclarations > ResolvingReferences >
//! Pending > Ready`.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a module or of the whole project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    /// Edits observed, not parsed yet
    Pending,
    /// Syntax trees are being built
    Parsing,
    ResolvingDeclarations,
    ResolvingReferences,
    /// The published index reflects the current sources
    Ready,
    /// The pipeline failed; the last-good index is still readable
    Error,
    /// A suspension is active; reads are allowed, reparsing is deferred
    Busy,
}

impl ParseStatus {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Parsing => "parsing",
            Self::ResolvingDeclarations => "resolving_declarations",
            Self::ResolvingReferences => "resolving_references",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Busy => "busy",
        }
    }

    /// All statuses, best first
    pub fn all() -> [ParseStatus; 7] {
        [
            Self::Ready,
            Self::Pending,
            Self::ResolvingReferences,
            Self::ResolvingDeclarations,
            Self::Parsing,
            Self::Busy,
            Self::Error,
        ]
    }

    /// Severity rank used for aggregation (higher is worse)
    pub fn severity(&self) -> u8 {
        match self {
            Self::Ready => 0,
            Self::Pending => 1,
            Self::ResolvingReferences => 2,
            Self::ResolvingDeclarations => 3,
            Self::Parsing => 4,
            Self::Busy => 5,
            Self::Error => 6,
        }
    }

    /// Whether a parse pass is working on something in this status
    pub fn is_parsing_family(&self) -> bool {
        matches!(
            self,
            Self::Parsing | Self::ResolvingDeclarations | Self::ResolvingReferences
        )
    }

    /// Whether a new parse pass may begin from this status
    pub fn can_begin_parse(&self) -> bool {
        matches!(self, Self::Ready | Self::Pending | Self::Error)
    }

    /// Check a transition requested through the pipeline or a caller.
    ///
    /// Transitions into or out of `Busy` are never allowed here; only the
    /// suspension gate performs them (see [`ParseStatus::can_suspend_from`]).
    pub fn can_transition_to(&self, next: ParseStatus) -> bool {
        use ParseStatus::*;

        if *self == next {
            return true;
        }

        match (*self, next) {
            (Busy, _) | (_, Busy) => false,
            (_, Error) => true,
            (Ready | Pending | Error, Parsing) => true,
            (Ready | Error, Pending) => true,
            (Parsing, ResolvingDeclarations) => true,
            (ResolvingDeclarations, ResolvingReferences) => true,
            (ResolvingReferences, Ready) => true,
            _ => false,
        }
    }

    /// Suspension entry is allowed from every status except `Busy`
    pub fn can_suspend_from(&self) -> bool {
        *self != Self::Busy
    }
}

impl std::fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compute the aggregate (worst) status of a set of module statuses.
///
/// Returns `None` for an empty set. The result depends only on the multiset
/// of statuses, never on iteration order.
pub fn aggregate<I>(statuses: I) -> Option<ParseStatus>
where
    I: IntoIterator<Item = ParseStatus>,
{
    statuses.into_iter().max_by_key(|status| status.severity())
}

// ============================================================================
// Tests
// ============================================================================

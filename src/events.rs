//! State-changed notifications
//!
//! # Delivery Contract
//!
//! - Events are delivered synchronously with the transition that caused them
//! - Every listener sees every event in the order transitions occurred
//! - A listener that fails (returns `Err` or panics) is logged and skipped;
//!   remaining listeners still get the event and the parser status is not
//!   affected
//! - Listeners added or removed during dispatch take effect from the next
//!   event
//!
//! # JSON Event Stream
//!
//! [`EventEmitter`] writes events as JSON Lines for the CLI:
//! ```json
//! {"type":"state_changed","sequence":3,"previous":"ready","current":"busy",...}
//! ```

use std::io::{self, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use uuid::Uuid;

use crate::scheduler::PassSummary;
use crate::status::ParseStatus;

/// Identity of whoever caused a transition
#[derive(Debug, Clone, Serialize)]
pub struct Actor {
    pub id: Uuid,
    pub name: String,
}

impl Actor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

impl PartialEq for Actor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Actor {}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Trait for events written to the JSON stream
pub trait EngineEvent: Serialize {
    fn event_type() -> &'static str;
}

/// One aggregate status transition
#[derive(Debug, Clone, Serialize)]
pub struct StateChangedEvent {
    /// Position in the total order of transitions (starts at 1)
    pub sequence: u64,
    pub previous: ParseStatus,
    pub current: ParseStatus,
    pub actor: Actor,
    /// Timestamp (ISO 8601)
    pub timestamp: String,
}

impl StateChangedEvent {
    pub fn new(sequence: u64, previous: ParseStatus, current: ParseStatus, actor: Actor) -> Self {
        Self {
            sequence,
            previous,
            current,
            actor,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl EngineEvent for StateChangedEvent {
    fn event_type() -> &'static str {
        "state_changed"
    }
}

/// Emitted by the CLI after each parse pass
#[derive(Debug, Clone, Serialize)]
pub struct PassCompletedEvent {
    pub generation: u64,
    pub status: ParseStatus,
    pub modules_parsed: usize,
    pub modules_reused: usize,
    pub failed_modules: Vec<String>,
    pub declarations: usize,
    pub duration_ms: u64,
    pub timestamp: String,
}

impl PassCompletedEvent {
    pub fn from_summary(summary: &PassSummary, status: ParseStatus, declarations: usize) -> Self {
        Self {
            generation: summary.generation,
            status,
            modules_parsed: summary.modules_parsed,
            modules_reused: summary.modules_reused,
            failed_modules: summary
                .failed_modules
                .iter()
                .map(|m| m.to_string())
                .collect(),
            declarations,
            duration_ms: summary.duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl EngineEvent for PassCompletedEvent {
    fn event_type() -> &'static str {
        "pass_completed"
    }
}

/// Receiver of state-changed notifications
///
/// Listeners run on the thread that caused the transition, with the
/// coordinator lock held. Status reads, `set_status` calls and parse requests
/// from every other thread wait until the listener returns. Listeners may
/// read status and the index and may raise parse requests (an inline pass
/// then runs inside the listener), but must not block waiting on another
/// thread that needs the coordinator.
pub trait StateListener: Send + Sync {
    fn on_state_changed(&self, event: &StateChangedEvent) -> anyhow::Result<()>;
}

impl<F> StateListener for F
where
    F: Fn(&StateChangedEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_state_changed(&self, event: &StateChangedEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Handle returned by [`NotificationBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Outcome of delivering one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Ordered observer list for state-changed events
#[derive(Default)]
pub struct NotificationBus {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn StateListener>)>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener; it receives events after all earlier subscribers
    pub fn subscribe(&self, listener: Arc<dyn StateListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        tracing::debug!("[BUS] Listener {:?} subscribed", id);
        id
    }

    /// Subscribe a closure
    pub fn subscribe_fn<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateChangedEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(listener))
    }

    /// Remove a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sub, _)| *sub != id);
        let removed = listeners.len() != before;
        if removed {
            tracing::debug!("[BUS] Listener {:?} unsubscribed", id);
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Total listener failures since creation
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver an event to every current listener, isolating failures
    pub fn dispatch(&self, event: &StateChangedEvent) -> DispatchReport {
        // Snapshot so listeners can (un)subscribe during dispatch
        let listeners: Vec<_> = self.listeners.read().clone();
        let mut report = DispatchReport::default();

        for (id, listener) in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_state_changed(event)));
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!(
                        "[BUS] Listener {:?} failed on {} -> {}: {}",
                        id,
                        event.previous,
                        event.current,
                        e
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::error!(
                        "[BUS] Listener {:?} panicked on {} -> {}",
                        id,
                        event.previous,
                        event.current
                    );
                }
            }
        }

        if report.failed > 0 {
            self.failures
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        report
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("listeners", &self.listener_count())
            .field("failures", &self.failure_count())
            .finish()
    }
}

// ============================================================================
// JSON Lines Emitter
// ============================================================================

/// Wrapper for events with type field
#[derive(Serialize)]
struct EventWrapper<'a, P: Serialize> {
    #[serde(rename = "type")]
    event_type: &'static str,
    #[serde(flatten)]
    payload: &'a P,
}

/// Writes events as JSON Lines
pub struct EventEmitter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl EventEmitter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn emit<E: EngineEvent>(&self, event: &E) -> io::Result<()> {
        let wrapper = EventWrapper {
            event_type: E::event_type(),
            payload: event,
        };
        let json = serde_json::to_string(&wrapper).map_err(io::Error::other)?;
        let mut out = self.out.lock();
        writeln!(out, "{}", json)?;
        out.flush()
    }
}

impl StateListener for EventEmitter {
    fn on_state_changed(&self, event: &StateChangedEvent) -> anyhow::Result<()> {
        self.emit(event)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

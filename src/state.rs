//! Parser state machine: the single source of truth for parse status
//!
//! # Thread Safety
//!
//! All mutable coordinator state (module statuses, suspension, pass flags,
//! dirty set, event queue) lives in one [`Core`] behind a `parking_lot`
//! `ReentrantMutex`. Every change goes through [`StateMachine::transact`],
//! which validates, mutates and enqueues the resulting event in one critical
//! section and then delivers queued events before releasing the lock.
//!
//! - Other threads never observe a status without its event having been
//!   delivered first
//! - The lock is re-entrant so listeners and suspended actions running on
//!   the owning thread may still read status or raise parse requests;
//!   events they cause are queued behind the event being dispatched
//! - The published [`DeclarationIndex`] sits in an `ArcSwap` outside the
//!   lock: `current_index()` never blocks
//! - Listeners run on the dispatching thread with the core lock held: every
//!   other thread's reads, `set_status` calls and parse requests wait until
//!   the listener returns
//!
//! # Locking Order
//!
//! 1. `StateMachine::core`
//! 2. `StateMachine::idle_lock`
//!
//! `notify_idle` may run with the core lock held (an inline pass started by
//! a listener). `wait_until_idle` therefore never reads core state while it
//! holds `idle_lock`; it compares idle epochs instead.
//!
//! Never hold the core lock while calling into the pipeline or the module
//! provider.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, ReentrantMutex};

use crate::declarations::DeclarationIndex;
use crate::error::{ParserStateError, ResolutionError, Result, SyntaxError};
use crate::events::{Actor, NotificationBus, StateChangedEvent, StateListener, SubscriptionId};
use crate::project::ModuleId;
use crate::scheduler::SchedulerStats;
use crate::status::{aggregate, ParseStatus};
use crate::suspension::ActiveSuspension;

/// Modules touched by edits since the last pass started
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DirtySet {
    #[default]
    Clean,
    Modules(BTreeSet<ModuleId>),
    All,
}

impl DirtySet {
    pub fn mark_all(&mut self) {
        *self = DirtySet::All;
    }

    pub fn mark<I: IntoIterator<Item = ModuleId>>(&mut self, modules: I) {
        match self {
            DirtySet::All => {}
            DirtySet::Clean => {
                *self = DirtySet::Modules(modules.into_iter().collect());
            }
            DirtySet::Modules(set) => set.extend(modules),
        }
    }

    pub fn merge(&mut self, other: &DirtySet) {
        match other {
            DirtySet::Clean => {}
            DirtySet::All => self.mark_all(),
            DirtySet::Modules(set) => self.mark(set.iter().cloned()),
        }
    }

    pub fn take(&mut self) -> DirtySet {
        std::mem::take(self)
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, DirtySet::Clean)
    }

    pub fn contains(&self, module: &ModuleId) -> bool {
        match self {
            DirtySet::Clean => false,
            DirtySet::All => true,
            DirtySet::Modules(set) => set.contains(module),
        }
    }
}

/// Why the project is (or was last) in `Error`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassFailure {
    /// Modules whose syntax tree could not be built
    Syntax(Vec<SyntaxError>),
    /// Project-wide resolution failure
    Resolution(ResolutionError),
    /// The module set could not be read
    ModuleSource(String),
}

impl PassFailure {
    /// The failure as an error value (first module for syntax failures)
    pub fn to_error(&self) -> ParserStateError {
        match self {
            PassFailure::Syntax(errors) => match errors.first() {
                Some(e) => ParserStateError::Syntax(e.clone()),
                None => ParserStateError::ModuleSource {
                    message: "syntax failure without details".to_string(),
                },
            },
            PassFailure::Resolution(e) => ParserStateError::Resolution(e.clone()),
            PassFailure::ModuleSource(message) => ParserStateError::ModuleSource {
                message: message.clone(),
            },
        }
    }
}

impl std::fmt::Display for PassFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassFailure::Syntax(errors) => {
                write!(f, "{} module(s) failed to parse", errors.len())?;
                for e in errors {
                    write!(f, "\n  {}", e)?;
                }
                Ok(())
            }
            PassFailure::Resolution(e) => write!(f, "{}", e),
            PassFailure::ModuleSource(message) => write!(f, "Module source unavailable: {}", message),
        }
    }
}

/// Mutable coordinator state, only reachable through [`StateMachine::transact`]
#[derive(Debug)]
pub struct Core {
    /// Project status used while no modules are known
    pub(crate) base_status: ParseStatus,
    pub(crate) modules: BTreeMap<ModuleId, ParseStatus>,
    pub(crate) suspension: Option<ActiveSuspension>,
    pub(crate) pass_in_flight: bool,
    /// Requests arrived while a pass was running
    pub(crate) rerun_requested: bool,
    /// Requests arrived while suspended
    pub(crate) pending_reparse: bool,
    pub(crate) dirty: DirtySet,
    pub(crate) last_failure: Option<PassFailure>,
    pub(crate) stats: SchedulerStats,
    sequence: u64,
    queue: VecDeque<StateChangedEvent>,
    dispatching: bool,
}

impl Core {
    fn new() -> Self {
        Self {
            base_status: ParseStatus::Pending,
            modules: BTreeMap::new(),
            suspension: None,
            pass_in_flight: false,
            rerun_requested: false,
            pending_reparse: false,
            dirty: DirtySet::Clean,
            last_failure: None,
            stats: SchedulerStats::default(),
            sequence: 0,
            queue: VecDeque::new(),
            dispatching: false,
        }
    }

    /// Aggregate project status
    pub fn status(&self) -> ParseStatus {
        if self.suspension.is_some() {
            return ParseStatus::Busy;
        }
        aggregate(self.modules.values().copied()).unwrap_or(self.base_status)
    }

    /// Move every module currently in `from` (and the base status) to `to`
    pub(crate) fn advance(&mut self, from: ParseStatus, to: ParseStatus) {
        for status in self.modules.values_mut() {
            if *status == from {
                *status = to;
            }
        }
        if self.base_status == from {
            self.base_status = to;
        }
    }

    /// Force a status onto a set of modules
    pub(crate) fn set_modules<'a, I>(&mut self, modules: I, to: ParseStatus)
    where
        I: IntoIterator<Item = &'a ModuleId>,
    {
        for id in modules {
            self.modules.insert(id.clone(), to);
        }
    }

    /// Mark the dirty modules `Pending` (edits observed)
    pub(crate) fn mark_pending(&mut self) {
        let mut touch = |status: &mut ParseStatus| {
            if status.can_transition_to(ParseStatus::Pending) {
                *status = ParseStatus::Pending;
            }
        };

        match &self.dirty {
            DirtySet::Clean => {}
            DirtySet::All => {
                self.modules.values_mut().for_each(&mut touch);
                touch(&mut self.base_status);
            }
            DirtySet::Modules(set) => {
                for id in set {
                    match self.modules.get_mut(id) {
                        Some(status) => touch(status),
                        None => {
                            self.modules.insert(id.clone(), ParseStatus::Pending);
                        }
                    }
                }
                touch(&mut self.base_status);
            }
        }
    }

    /// Claim the right to run passes. Fails while suspended or while
    /// another pass is in flight.
    pub(crate) fn claim_pass(&mut self) -> bool {
        if self.pass_in_flight || self.suspension.is_some() {
            return false;
        }
        self.pass_in_flight = true;
        true
    }

    fn next_event(&mut self, previous: ParseStatus, current: ParseStatus, actor: &Actor) {
        self.sequence += 1;
        self.queue.push_back(StateChangedEvent::new(
            self.sequence,
            previous,
            current,
            actor.clone(),
        ));
    }
}

/// Holds lifecycle status and the published declaration index
pub struct StateMachine {
    core: ReentrantMutex<RefCell<Core>>,
    bus: NotificationBus,
    index: ArcSwap<DeclarationIndex>,
    /// Bumped every time a pass finishes
    idle_lock: Mutex<u64>,
    idle_cv: Condvar,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            core: ReentrantMutex::new(RefCell::new(Core::new())),
            bus: NotificationBus::new(),
            index: ArcSwap::from_pointee(DeclarationIndex::empty()),
            idle_lock: Mutex::new(0),
            idle_cv: Condvar::new(),
        }
    }

    // ========================================================================
    // Read Operations
    // ========================================================================

    /// Current aggregate status
    pub fn status(&self) -> ParseStatus {
        self.read(|core| core.status())
    }

    /// Status of one module, if known
    pub fn module_status(&self, module: &ModuleId) -> Option<ParseStatus> {
        self.read(|core| core.modules.get(module).copied())
    }

    pub fn module_statuses(&self) -> BTreeMap<ModuleId, ParseStatus> {
        self.read(|core| core.modules.clone())
    }

    /// Last successfully published index; never blocks
    pub fn current_index(&self) -> Arc<DeclarationIndex> {
        self.index.load_full()
    }

    /// Status and index read in one critical section
    pub fn snapshot(&self) -> (ParseStatus, Arc<DeclarationIndex>) {
        self.read(|core| (core.status(), self.index.load_full()))
    }

    pub fn last_failure(&self) -> Option<PassFailure> {
        self.read(|core| core.last_failure.clone())
    }

    pub fn stats(&self) -> SchedulerStats {
        self.read(|core| core.stats.clone())
    }

    pub fn is_suspended(&self) -> bool {
        self.read(|core| core.suspension.is_some())
    }

    pub fn is_pass_in_flight(&self) -> bool {
        self.read(|core| core.pass_in_flight)
    }

    /// Read core state under the lock
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Core) -> R,
    {
        let guard = self.core.lock();
        let core = guard.borrow();
        f(&core)
    }

    // ========================================================================
    // Write Operations
    // ========================================================================

    /// Apply a change to the core state atomically.
    ///
    /// If the aggregate status differs afterwards, one [`StateChangedEvent`]
    /// attributed to `actor` is published before this returns (unless the
    /// caller is itself a listener being dispatched to, in which case the
    /// event is delivered right after the current one).
    pub(crate) fn transact<F, R>(&self, actor: &Actor, f: F) -> R
    where
        F: FnOnce(&mut Core) -> R,
    {
        let guard = self.core.lock();
        let result = {
            let mut core = guard.borrow_mut();
            let before = core.status();
            let result = f(&mut core);
            let after = core.status();
            if before != after {
                tracing::debug!("[STATE] {} -> {} ({})", before, after, actor);
                core.next_event(before, after, actor);
            }
            result
        };
        self.drain(&guard);
        result
    }

    /// Deliver queued events in order. Nested calls return immediately and
    /// leave their events to the outermost drain.
    fn drain(&self, guard: &RefCell<Core>) {
        {
            let mut core = guard.borrow_mut();
            if core.dispatching || core.queue.is_empty() {
                return;
            }
            core.dispatching = true;
        }

        loop {
            let next = guard.borrow_mut().queue.pop_front();
            let Some(event) = next else { break };
            self.bus.dispatch(&event);
        }

        guard.borrow_mut().dispatching = false;
    }

    /// Request an aggregate status change.
    ///
    /// Fails with `InvalidTransition` (leaving status unchanged) when the
    /// transition table does not allow it. `Busy` can only be entered or
    /// left through the suspension gate.
    pub fn set_status(&self, actor: &Actor, status: ParseStatus) -> Result<()> {
        self.transact(actor, |core| {
            let current = core.status();
            if core.suspension.is_some() || !current.can_transition_to(status) {
                tracing::warn!("[STATE] Rejected {} -> {} from {}", current, status, actor);
                return Err(ParserStateError::InvalidTransition {
                    from: current,
                    to: status,
                });
            }
            core.base_status = status;
            for module_status in core.modules.values_mut() {
                *module_status = status;
            }
            Ok(())
        })
    }

    /// Request a status change for one module, validated at module level
    pub fn set_module_status(
        &self,
        actor: &Actor,
        module: &ModuleId,
        status: ParseStatus,
    ) -> Result<()> {
        self.transact(actor, |core| {
            let current = core
                .modules
                .get(module)
                .copied()
                .unwrap_or(ParseStatus::Pending);
            if core.suspension.is_some() {
                return Err(ParserStateError::InvalidTransition {
                    from: ParseStatus::Busy,
                    to: status,
                });
            }
            if !current.can_transition_to(status) {
                return Err(ParserStateError::InvalidTransition {
                    from: current,
                    to: status,
                });
            }
            core.modules.insert(module.clone(), status);
            Ok(())
        })
    }

    /// Replace the published index and apply `f` in the same critical
    /// section, so a reader that sees the resulting status also sees the
    /// new index.
    pub(crate) fn publish<F>(&self, actor: &Actor, index: DeclarationIndex, f: F)
    where
        F: FnOnce(&mut Core),
    {
        let index = Arc::new(index);
        self.transact(actor, |core| {
            self.index.store(index);
            f(core);
        });
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe(&self, listener: Arc<dyn StateListener>) -> SubscriptionId {
        self.bus.subscribe(listener)
    }

    pub fn subscribe_fn<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateChangedEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe_fn(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    // ========================================================================
    // Idle Tracking
    // ========================================================================

    /// Wake threads blocked in [`StateMachine::wait_until_idle`]
    pub(crate) fn notify_idle(&self) {
        let mut epoch = self.idle_lock.lock();
        *epoch = epoch.wrapping_add(1);
        self.idle_cv.notify_all();
    }

    /// Block until no pass is in flight. Returns false on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = *self.idle_lock.lock();
            if !self.is_pass_in_flight() {
                return true;
            }

            let mut epoch = self.idle_lock.lock();
            if *epoch != seen {
                // A pass finished between the two locks
                continue;
            }
            if self.idle_cv.wait_until(&mut epoch, deadline).timed_out() {
                drop(epoch);
                return !self.is_pass_in_flight();
            }
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("status", &self.status())
            .field("generation", &self.current_index().generation())
            .field("bus", &self.bus)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

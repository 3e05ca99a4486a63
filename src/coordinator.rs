//! Public entry point tying the state machine, scheduler and suspension
//! gate together
//!
//! ```text
//!  edits / callers ──> on_parse_requested ──> ParseScheduler ──> ResolutionPipeline
//!                                                  │
//!  suspend_parser ──> SuspensionGate ──┐           │ publish
//!                                      v           v
//!                                 StateMachine (status + index) ──> NotificationBus
//!                                      │
//!  readers <── current_index() / status() / snapshot()
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CoordinatorConfig, ExecutionMode};
use crate::declarations::DeclarationIndex;
use crate::error::{Result, SuspendError};
use crate::events::{Actor, StateChangedEvent, StateListener, SubscriptionId};
use crate::pipeline::ResolutionPipeline;
use crate::project::{ModuleId, ModuleProvider};
use crate::scheduler::{ParseRequestOutcome, ParseScheduler, PassSummary, SchedulerStats};
use crate::state::{PassFailure, StateMachine};
use crate::status::ParseStatus;
use crate::suspension::{ReleaseOutcome, SuspensionGate, SuspensionToken};

/// Owns the parse lifecycle of one project
///
/// Cheap to clone; clones share the same state.
pub struct ParserStateCoordinator<P: ResolutionPipeline> {
    machine: Arc<StateMachine>,
    scheduler: Arc<ParseScheduler<P>>,
    gate: SuspensionGate,
    execution: ExecutionMode,
}

impl<P: ResolutionPipeline> Clone for ParserStateCoordinator<P> {
    fn clone(&self) -> Self {
        Self {
            machine: Arc::clone(&self.machine),
            scheduler: Arc::clone(&self.scheduler),
            gate: self.gate.clone(),
            execution: self.execution,
        }
    }
}

impl<P: ResolutionPipeline> ParserStateCoordinator<P> {
    pub fn new(
        pipeline: P,
        provider: Arc<dyn ModuleProvider>,
        config: &CoordinatorConfig,
    ) -> Result<Self> {
        let machine = Arc::new(StateMachine::new());
        let scheduler = ParseScheduler::new(pipeline, provider, Arc::clone(&machine), config)?;
        let gate = SuspensionGate::new(Arc::clone(&machine));

        tracing::debug!(
            "[STATE] Coordinator created ({:?}, parallel_syntax={})",
            config.execution,
            config.parallel_syntax
        );
        Ok(Self {
            machine,
            scheduler,
            gate,
            execution: config.execution,
        })
    }

    pub fn execution(&self) -> ExecutionMode {
        self.execution
    }

    // ========================================================================
    // Parse Requests
    // ========================================================================

    /// Request a full reparse
    pub fn on_parse_requested(&self, actor: &Actor) -> ParseRequestOutcome {
        self.scheduler.on_parse_requested(actor)
    }

    /// Request a reparse of the given modules
    pub fn on_modules_changed<I>(&self, actor: &Actor, modules: I) -> ParseRequestOutcome
    where
        I: IntoIterator<Item = ModuleId>,
    {
        self.scheduler.on_modules_changed(actor, modules)
    }

    // ========================================================================
    // Suspension
    // ========================================================================

    /// Run `action` with the parser suspended.
    ///
    /// Fails without running the action when another suspension is active
    /// (`BusyConflict`) or a pass is executing (`PassInFlight`). Parse
    /// requests raised while the action runs are turned into exactly one
    /// pass, scheduled before this returns.
    pub fn suspend_parser<T, E, F>(
        &self,
        actor: &Actor,
        action: F,
    ) -> std::result::Result<T, SuspendError<E>>
    where
        F: FnOnce(&SuspensionToken) -> std::result::Result<T, E>,
    {
        // A pass cannot run inline while unwinding
        let claim_on_unwind = self.execution == ExecutionMode::Background;
        let scheduler = &self.scheduler;

        self.gate.run(actor, claim_on_unwind, action, |outcome| {
            if outcome == ReleaseOutcome::ReparseQueued {
                tracing::debug!("[SUSPEND] Running reparse queued during suspension");
                scheduler.dispatch();
            }
        })
    }

    pub fn is_suspended(&self) -> bool {
        self.gate.is_suspended()
    }

    /// Name of the actor holding the suspension, if any
    pub fn suspension_holder(&self) -> Option<String> {
        self.gate.holder()
    }

    // ========================================================================
    // Status & Index
    // ========================================================================

    pub fn status(&self) -> ParseStatus {
        self.machine.status()
    }

    pub fn module_status(&self, module: &ModuleId) -> Option<ParseStatus> {
        self.machine.module_status(module)
    }

    pub fn module_statuses(&self) -> BTreeMap<ModuleId, ParseStatus> {
        self.machine.module_statuses()
    }

    /// Request an aggregate status change (validated)
    pub fn set_status(&self, actor: &Actor, status: ParseStatus) -> Result<()> {
        self.machine.set_status(actor, status)
    }

    /// Request a module status change (validated)
    pub fn set_module_status(
        &self,
        actor: &Actor,
        module: &ModuleId,
        status: ParseStatus,
    ) -> Result<()> {
        self.machine.set_module_status(actor, module, status)
    }

    /// Last published index; never blocks
    pub fn current_index(&self) -> Arc<DeclarationIndex> {
        self.machine.current_index()
    }

    /// Status and index read together
    pub fn snapshot(&self) -> (ParseStatus, Arc<DeclarationIndex>) {
        self.machine.snapshot()
    }

    /// Why the last pass failed, if it did
    pub fn last_error(&self) -> Option<PassFailure> {
        self.machine.last_failure()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.machine.stats()
    }

    pub fn last_pass(&self) -> Option<PassSummary> {
        self.machine.stats().last_pass
    }

    /// Block until no pass is in flight. Returns false on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        self.machine.wait_until_idle(timeout)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe(&self, listener: Arc<dyn StateListener>) -> SubscriptionId {
        self.machine.subscribe(listener)
    }

    pub fn subscribe_fn<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateChangedEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.machine.subscribe_fn(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.machine.unsubscribe(id)
    }

    /// Actor used for the scheduler's own transitions
    pub fn parser_actor(&self) -> &Actor {
        self.scheduler.actor()
    }
}

impl<P: ResolutionPipeline> std::fmt::Debug for ParserStateCoordinator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserStateCoordinator")
            .field("machine", &self.machine)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

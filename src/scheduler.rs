//! Parse scheduling: coalescing requests and driving the pipeline
//!
//! # Request Handling
//!
//! | Coordinator state | Outcome                                      |
//! |-------------------|----------------------------------------------|
//! | suspended         | `Deferred`: pending-reparse flag + dirty set |
//! | pass in flight    | `Coalesced`: one follow-up pass              |
//! | idle              | `Started`: dirty modules `Pending`, pass run |
//!
//! # Pass Stages
//!
//! ```text
//! Pending ──> Parsing ──> ResolvingDeclarations ──> ResolvingReferences ──> Ready
//!                │                 │                         │
//!                └─ syntax error ──┴──── resolution error ───┴──> Error
//! ```
//!
//! The pipeline always runs with the state lock released; each stage
//! boundary is one `transact` on the state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{CoordinatorConfig, ExecutionMode};
use crate::error::{ParserStateError, ResolutionError, Result, SyntaxError};
use crate::events::Actor;
use crate::pipeline::{ProjectSyntax, ResolutionPipeline};
use crate::project::{ModuleId, ModuleProvider, SourceModule};
use crate::state::{Core, DirtySet, PassFailure, StateMachine};
use crate::status::ParseStatus;
use crate::tree_cache::TreeCache;

/// Name of the actor the scheduler uses for its own transitions
pub const PARSER_ACTOR: &str = "parser";

/// Result of a parse request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseRequestOutcome {
    /// Suspended; the request runs once the suspension ends
    Deferred,
    /// A pass is running; folded into one follow-up pass
    Coalesced,
    /// A pass was started
    Started,
}

/// Summary of one parse pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassSummary {
    /// Generation of the index the pass published (unchanged on failure)
    pub generation: u64,
    pub published: bool,
    /// Modules whose tree was built by the pipeline
    pub modules_parsed: usize,
    /// Modules whose cached tree matched their source
    pub modules_reused: usize,
    pub failed_modules: Vec<ModuleId>,
    pub duration_ms: u64,
}

/// Counters kept across passes
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub passes_started: u64,
    pub passes_completed: u64,
    pub passes_failed: u64,
    pub requests_started: u64,
    pub requests_coalesced: u64,
    pub requests_deferred: u64,
    pub modules_parsed: u64,
    pub modules_reused: u64,
    pub last_pass: Option<PassSummary>,
}

/// Modules a pass will rebuild
struct PassPlan {
    affected: BTreeSet<ModuleId>,
}

enum BuildOutcome<T> {
    Reused(Arc<T>),
    Built(u64, Arc<T>),
    Failed(SyntaxError),
}

/// Drives the resolution pipeline for a project
pub struct ParseScheduler<P: ResolutionPipeline> {
    pipeline: P,
    provider: Arc<dyn ModuleProvider>,
    machine: Arc<StateMachine>,
    actor: Actor,
    parallel_syntax: bool,
    cache: TreeCache<P::Tree>,
    /// Wakes the background worker; `None` in inline mode
    worker: Mutex<Option<Sender<()>>>,
}

impl<P: ResolutionPipeline> ParseScheduler<P> {
    /// Create a scheduler and, in background mode, its worker thread
    pub fn new(
        pipeline: P,
        provider: Arc<dyn ModuleProvider>,
        machine: Arc<StateMachine>,
        config: &CoordinatorConfig,
    ) -> Result<Arc<Self>> {
        let scheduler = Arc::new(Self {
            pipeline,
            provider,
            machine,
            actor: Actor::new(PARSER_ACTOR),
            parallel_syntax: config.parallel_syntax,
            cache: TreeCache::new(),
            worker: Mutex::new(None),
        });

        if config.execution == ExecutionMode::Background {
            let (tx, rx) = mpsc::channel();
            let weak = Arc::downgrade(&scheduler);
            std::thread::Builder::new()
                .name("parser-state-worker".to_string())
                .spawn(move || Self::worker_loop(weak, rx))?;
            *scheduler.worker.lock() = Some(tx);
            tracing::debug!("[SCHEDULER] Background worker started");
        }

        Ok(scheduler)
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn is_background(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Number of cached syntax trees
    pub fn cached_trees(&self) -> usize {
        self.cache.len()
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Request a reparse of every module
    pub fn on_parse_requested(&self, actor: &Actor) -> ParseRequestOutcome {
        self.request(actor, DirtySet::All)
    }

    /// Request a reparse of specific modules
    pub fn on_modules_changed<I>(&self, actor: &Actor, modules: I) -> ParseRequestOutcome
    where
        I: IntoIterator<Item = ModuleId>,
    {
        let mut scope = DirtySet::Clean;
        scope.mark(modules);
        self.request(actor, scope)
    }

    fn request(&self, actor: &Actor, scope: DirtySet) -> ParseRequestOutcome {
        let outcome = self.machine.transact(actor, |core| {
            core.dirty.merge(&scope);

            if core.suspension.is_some() {
                core.pending_reparse = true;
                core.stats.requests_deferred += 1;
                return ParseRequestOutcome::Deferred;
            }
            if core.pass_in_flight {
                core.rerun_requested = true;
                core.stats.requests_coalesced += 1;
                return ParseRequestOutcome::Coalesced;
            }

            core.mark_pending();
            core.pass_in_flight = true;
            core.stats.requests_started += 1;
            ParseRequestOutcome::Started
        });

        tracing::debug!("[SCHEDULER] Request from {}: {:?}", actor, outcome);
        if outcome == ParseRequestOutcome::Started {
            self.dispatch();
        }
        outcome
    }

    /// Run a pass that has already been claimed, inline or on the worker
    pub(crate) fn dispatch(&self) {
        let sent = match self.worker.lock().as_ref() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        };
        if sent {
            return;
        }
        if self.is_background() {
            tracing::warn!("[SCHEDULER] Worker gone, running pass inline");
        }
        self.run_passes();
    }

    fn worker_loop(scheduler: Weak<Self>, rx: Receiver<()>) {
        while rx.recv().is_ok() {
            let Some(scheduler) = scheduler.upgrade() else {
                break;
            };
            if catch_unwind(AssertUnwindSafe(|| scheduler.run_passes())).is_err() {
                tracing::error!("[SCHEDULER] Parse pass panicked on worker");
            }
        }
        tracing::debug!("[SCHEDULER] Background worker stopped");
    }

    // ========================================================================
    // Passes
    // ========================================================================

    /// Run the claimed pass plus any follow-up passes coalesced meanwhile
    pub(crate) fn run_passes(&self) {
        let mut in_flight = InFlightGuard {
            scheduler: self,
            finished: false,
        };

        loop {
            self.run_pass();

            let rerun = self.machine.transact(&self.actor, |core| {
                if core.rerun_requested {
                    core.rerun_requested = false;
                    core.mark_pending();
                    true
                } else {
                    core.pass_in_flight = false;
                    false
                }
            });
            if !rerun {
                break;
            }
            tracing::debug!("[SCHEDULER] Running coalesced follow-up pass");
        }

        in_flight.finished = true;
        self.machine.notify_idle();
    }

    fn run_pass(&self) {
        let started = Instant::now();

        let modules = match self.provider.modules() {
            Ok(modules) => modules,
            Err(e) => {
                self.fail_source(e, started);
                return;
            }
        };

        let present: BTreeSet<ModuleId> = modules.iter().map(|m| m.id.clone()).collect();
        let stale: BTreeSet<ModuleId> = modules
            .iter()
            .filter(|m| self.cache.fresh(m).is_none())
            .map(|m| m.id.clone())
            .collect();

        let plan = self
            .machine
            .transact(&self.actor, |core| Self::plan_pass(core, &present, &stale));
        let Some(plan) = plan else {
            tracing::debug!("[SCHEDULER] Nothing to reparse");
            return;
        };
        self.cache.retain_modules(&present);

        // Stage 1: syntax trees
        let targets: Vec<&SourceModule> = modules
            .iter()
            .filter(|m| plan.affected.contains(&m.id))
            .collect();
        let outcomes: Vec<BuildOutcome<P::Tree>> = if self.parallel_syntax {
            targets.par_iter().map(|m| self.build_tree(m)).collect()
        } else {
            targets.iter().map(|m| self.build_tree(m)).collect()
        };

        let mut summary = PassSummary::default();
        let mut syntax_errors = Vec::new();
        for (module, outcome) in targets.iter().zip(outcomes) {
            match outcome {
                BuildOutcome::Reused(_) => summary.modules_reused += 1,
                BuildOutcome::Built(hash, tree) => {
                    summary.modules_parsed += 1;
                    self.cache.insert(module.id.clone(), hash, tree);
                }
                BuildOutcome::Failed(e) => {
                    tracing::warn!("[SCHEDULER] {}", e);
                    summary.failed_modules.push(module.id.clone());
                    syntax_errors.push(e);
                }
            }
        }

        let trees: BTreeMap<ModuleId, Arc<P::Tree>> = modules
            .iter()
            .filter_map(|m| self.cache.last_good(&m.id).map(|tree| (m.id.clone(), tree)))
            .collect();
        let project = ProjectSyntax::new(trees);

        self.machine.transact(&self.actor, |core| {
            core.set_modules(&summary.failed_modules, ParseStatus::Error);
            core.advance(ParseStatus::Parsing, ParseStatus::ResolvingDeclarations);
        });

        // Stage 2: declarations
        let declarations = match self.pipeline.resolve_declarations(&project) {
            Ok(declarations) => declarations,
            Err(e) => {
                self.fail_resolution(e, summary, started);
                return;
            }
        };

        self.machine.transact(&self.actor, |core| {
            core.advance(
                ParseStatus::ResolvingDeclarations,
                ParseStatus::ResolvingReferences,
            );
        });

        // Stage 3: references
        let resolved = match self.pipeline.resolve_references(declarations, &project) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.fail_resolution(e, summary, started);
                return;
            }
        };

        summary.generation = self.machine.current_index().generation() + 1;
        summary.published = true;
        summary.duration_ms = started.elapsed().as_millis() as u64;
        let index = resolved.build(summary.generation);

        tracing::info!(
            "[SCHEDULER] Pass {} published: {} declarations, {} parsed, {} reused, {} failed in {}ms",
            summary.generation,
            index.len(),
            summary.modules_parsed,
            summary.modules_reused,
            summary.failed_modules.len(),
            summary.duration_ms
        );

        self.machine.publish(&self.actor, index, |core| {
            core.advance(ParseStatus::ResolvingReferences, ParseStatus::Ready);
            core.last_failure = if syntax_errors.is_empty() {
                None
            } else {
                Some(PassFailure::Syntax(syntax_errors))
            };
            core.stats.passes_completed += 1;
            core.stats.modules_parsed += summary.modules_parsed as u64;
            core.stats.modules_reused += summary.modules_reused as u64;
            core.stats.last_pass = Some(summary);
        });
    }

    /// Sync the module set and move affected modules to `Parsing`.
    /// Returns `None` when there is nothing to rebuild.
    fn plan_pass(
        core: &mut Core,
        present: &BTreeSet<ModuleId>,
        stale: &BTreeSet<ModuleId>,
    ) -> Option<PassPlan> {
        let dirty = core.dirty.take();

        let removed: Vec<ModuleId> = core
            .modules
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();
        for id in &removed {
            core.modules.remove(id);
        }
        for id in present {
            core.modules
                .entry(id.clone())
                .or_insert(ParseStatus::Pending);
        }

        // Removing a module can change how every other module resolves
        let affected: BTreeSet<ModuleId> = if removed.is_empty() {
            core.modules
                .iter()
                .filter(|(id, status)| {
                    dirty.contains(id)
                        || stale.contains(*id)
                        || matches!(status, ParseStatus::Pending | ParseStatus::Error)
                })
                .map(|(id, _)| id.clone())
                .collect()
        } else {
            present.clone()
        };

        if affected.is_empty() && !core.modules.is_empty() {
            return None;
        }

        core.stats.passes_started += 1;
        core.base_status = ParseStatus::Parsing;
        core.set_modules(&affected, ParseStatus::Parsing);
        tracing::debug!(
            "[SCHEDULER] Pass planned: {} of {} modules, {} removed",
            affected.len(),
            core.modules.len(),
            removed.len()
        );
        Some(PassPlan { affected })
    }

    fn build_tree(&self, module: &SourceModule) -> BuildOutcome<P::Tree> {
        if let Some(tree) = self.cache.fresh(module) {
            return BuildOutcome::Reused(tree);
        }
        match self.pipeline.build_syntax_tree(module) {
            Ok(tree) => BuildOutcome::Built(module.content_hash(), Arc::new(tree)),
            Err(e) => BuildOutcome::Failed(e),
        }
    }

    // ========================================================================
    // Failure Paths
    // ========================================================================

    fn fail_resolution(&self, error: ResolutionError, mut summary: PassSummary, started: Instant) {
        tracing::error!("[SCHEDULER] {}; keeping previous index", error);
        summary.generation = self.machine.current_index().generation();
        summary.duration_ms = started.elapsed().as_millis() as u64;
        self.fail_pass(PassFailure::Resolution(error), summary);
    }

    fn fail_source(&self, error: ParserStateError, started: Instant) {
        tracing::error!("[SCHEDULER] Cannot read modules: {}", error);
        let summary = PassSummary {
            generation: self.machine.current_index().generation(),
            duration_ms: started.elapsed().as_millis() as u64,
            ..PassSummary::default()
        };
        self.machine.transact(&self.actor, |core| {
            core.stats.passes_started += 1;
            core.advance(ParseStatus::Pending, ParseStatus::Error);
        });
        self.fail_pass(PassFailure::ModuleSource(error.to_string()), summary);
    }

    /// Move everything still in the parsing family to `Error`
    fn fail_pass(&self, failure: PassFailure, summary: PassSummary) {
        self.machine.transact(&self.actor, |core| {
            for status in core.modules.values_mut() {
                if status.is_parsing_family() {
                    *status = ParseStatus::Error;
                }
            }
            if core.base_status.is_parsing_family() {
                core.base_status = ParseStatus::Error;
            }
            core.last_failure = Some(failure);
            core.stats.passes_failed += 1;
            core.stats.last_pass = Some(summary);
        });
    }
}

impl<P: ResolutionPipeline> std::fmt::Debug for ParseScheduler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParseScheduler")
            .field("background", &self.is_background())
            .field("parallel_syntax", &self.parallel_syntax)
            .field("cached_trees", &self.cache.len())
            .finish()
    }
}

/// Clears the in-flight flag if a pass unwinds
struct InFlightGuard<'a, P: ResolutionPipeline> {
    scheduler: &'a ParseScheduler<P>,
    finished: bool,
}

impl<P: ResolutionPipeline> Drop for InFlightGuard<'_, P> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let scheduler = self.scheduler;
        scheduler.machine.transact(&scheduler.actor, |core| {
            for status in core.modules.values_mut() {
                if status.is_parsing_family() {
                    *status = ParseStatus::Error;
                }
            }
            if core.base_status.is_parsing_family() {
                core.base_status = ParseStatus::Error;
            }
            core.last_failure = Some(PassFailure::Resolution(ResolutionError::new(
                "parse pass panicked",
            )));
            core.stats.passes_failed += 1;
            core.rerun_requested = false;
            core.pass_in_flight = false;
        });
        scheduler.machine.notify_idle();
    }
}

// ============================================================================
// Tests
// ============================================================================

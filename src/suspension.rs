//! Exclusive suspend/resume protocol
//!
//! A suspension gives one caller a window in which no parse pass can start,
//! so it can edit module text and read the index without racing a reparse.
//! Parse requests raised meanwhile are recorded and turned into exactly one
//! pass once the window closes.
//!
//! ```text
//! acquire ──> status Busy ──> action(&token) ──> release ──┬─> prior status
//!                                                          └─> Pending + one pass
//! ```
//!
//! The token is owned by a drop guard, so an action that returns early or
//! panics still releases the suspension.

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::error::{ParserStateError, Result, SuspendError};
use crate::events::Actor;
use crate::state::StateMachine;
use crate::status::ParseStatus;

/// Proof of an active suspension, handed to the suspended action
#[derive(Debug)]
pub struct SuspensionToken {
    id: Uuid,
    actor: Actor,
    acquired_at: Instant,
}

impl SuspensionToken {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }
}

/// Suspension record kept in the state machine core
#[derive(Debug, Clone)]
pub struct ActiveSuspension {
    pub token_id: Uuid,
    pub actor: Actor,
    /// Aggregate status when the suspension began
    pub prior: ParseStatus,
}

/// What happened when a suspension ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// No request arrived; modules are back in their prior statuses
    Restored(ParseStatus),
    /// Requests arrived; dirty modules are `Pending` and a pass has been
    /// claimed for the caller to run
    ReparseQueued,
    /// Requests arrived; dirty modules are `Pending` and the work waits for
    /// the next parse request
    ReparseKept,
}

/// Grants and revokes the single suspension
#[derive(Debug, Clone)]
pub struct SuspensionGate {
    machine: Arc<StateMachine>,
}

impl SuspensionGate {
    pub fn new(machine: Arc<StateMachine>) -> Self {
        Self { machine }
    }

    /// Enter `Busy`. Never blocks: fails with `BusyConflict` when someone
    /// else holds the suspension and with `PassInFlight` while a pass runs.
    pub fn acquire(&self, actor: &Actor) -> Result<SuspensionToken> {
        let token = self.machine.transact(actor, |core| {
            if let Some(active) = &core.suspension {
                return Err(ParserStateError::BusyConflict {
                    holder: active.actor.name.clone(),
                });
            }
            if core.pass_in_flight {
                return Err(ParserStateError::PassInFlight);
            }

            let token = SuspensionToken {
                id: Uuid::new_v4(),
                actor: actor.clone(),
                acquired_at: Instant::now(),
            };
            core.suspension = Some(ActiveSuspension {
                token_id: token.id,
                actor: actor.clone(),
                prior: core.status(),
            });
            Ok(token)
        });

        match &token {
            Ok(t) => tracing::debug!("[SUSPEND] Acquired by {} ({})", actor, t.id),
            Err(e) => tracing::debug!("[SUSPEND] Rejected for {}: {}", actor, e),
        }
        token
    }

    /// Leave `Busy`.
    ///
    /// With `claim_pass` set, a queued reparse also claims the pass slot and
    /// the caller must run (or hand off) exactly one pass.
    pub fn release(&self, token: &SuspensionToken, claim_pass: bool) -> ReleaseOutcome {
        let outcome = self.machine.transact(&token.actor, |core| {
            match core.suspension.take() {
                Some(active) if active.token_id == token.id => {}
                other => {
                    tracing::warn!("[SUSPEND] Release with stale token {}", token.id);
                    core.suspension = other;
                    return ReleaseOutcome::Restored(core.status());
                }
            }

            if !core.pending_reparse {
                return ReleaseOutcome::Restored(core.status());
            }

            core.pending_reparse = false;
            core.mark_pending();
            if claim_pass && core.claim_pass() {
                ReleaseOutcome::ReparseQueued
            } else {
                ReleaseOutcome::ReparseKept
            }
        });

        tracing::debug!(
            "[SUSPEND] Released by {} after {:?}: {:?}",
            token.actor,
            token.acquired_at.elapsed(),
            outcome
        );
        outcome
    }

    /// Name of the actor holding the suspension
    pub fn holder(&self) -> Option<String> {
        self.machine
            .read(|core| core.suspension.as_ref().map(|s| s.actor.name.clone()))
    }

    pub fn is_suspended(&self) -> bool {
        self.machine.is_suspended()
    }

    /// Run `action` inside a suspension.
    ///
    /// `on_release` is called once with the release outcome, after the
    /// suspension has ended. When the action panics the guard releases with
    /// `claim_on_unwind`; callers that cannot run a pass during unwinding
    /// pass `false` and the work is kept for the next request.
    pub fn run<T, E, F, R>(
        &self,
        actor: &Actor,
        claim_on_unwind: bool,
        action: F,
        on_release: R,
    ) -> std::result::Result<T, SuspendError<E>>
    where
        F: FnOnce(&SuspensionToken) -> std::result::Result<T, E>,
        R: FnOnce(ReleaseOutcome),
    {
        let token = self.acquire(actor)?;
        let mut guard = SuspensionGuard {
            gate: self,
            token,
            released: false,
            claim_on_unwind,
            on_release: Some(on_release),
        };

        let result = action(&guard.token);
        guard.release(true);

        result.map_err(SuspendError::Action)
    }
}

/// Owns the token for the duration of the action
struct SuspensionGuard<'a, R: FnOnce(ReleaseOutcome)> {
    gate: &'a SuspensionGate,
    token: SuspensionToken,
    released: bool,
    claim_on_unwind: bool,
    on_release: Option<R>,
}

impl<R: FnOnce(ReleaseOutcome)> SuspensionGuard<'_, R> {
    fn release(&mut self, claim_pass: bool) {
        if self.released {
            return;
        }
        self.released = true;
        let outcome = self.gate.release(&self.token, claim_pass);
        if let Some(on_release) = self.on_release.take() {
            on_release(outcome);
        }
    }
}

impl<R: FnOnce(ReleaseOutcome)> Drop for SuspensionGuard<'_, R> {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!("[SUSPEND] Suspended action unwound, releasing");
            self.release(self.claim_on_unwind);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

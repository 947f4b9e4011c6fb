//! Commit lifecycle state machine.
//!
//! One [`CommitLifecycle`] per session. It reacts to three signals from the
//! hosting session and decides which bucket to dispatch:
//!
//! ```text
//!              before_commit                 after_commit
//!   Idle ──────────────────────▶ AwaitingOutcome ──────────▶ Idle
//!     ▲   (flush, lock, before)        │          (after, drop failed, unlock)
//!     │                                │
//!     │                                │ after_rollback
//!     └────────────────────────────────┘ (failed, drop after, unlock)
//!
//!   after_rollback from Idle: unlock only, no hooks
//!   discard_pending: drop every bucket (full rollback, no attempt)
//! ```
//!
//! `DispatchingBefore` is held while before hooks run. If one of them
//! fails the machine stays there, so the rollback that follows still sees
//! the outcome as pending and fires the failed bucket.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, info};

use crate::config::HooksConfig;
use crate::core::{Phase, SessionId};
use crate::dispatch::{dispatch_bucket, DispatchReport};
use crate::engine::{QueryHandle, ScopedQuery, StorageEngine};
use crate::tracker::{lock_tracker, ChangeTracker};

/// Where a session is in its commit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// No commit attempt in flight.
    #[default]
    Idle,
    /// Before hooks are running (or one of them failed).
    DispatchingBefore,
    /// Before hooks finished; the physical commit has not reported back.
    AwaitingOutcome,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::DispatchingBefore => "dispatching_before",
            LifecycleState::AwaitingOutcome => "awaiting_outcome",
        }
    }

    /// Whether a physical commit has been attempted and not yet resolved.
    pub fn outcome_pending(&self) -> bool {
        !matches!(self, LifecycleState::Idle)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ends a commit cycle when dropped: empties every bucket and unlocks.
///
/// Armed before after/failed dispatch so a failing hook cannot leave the
/// tracker locked or carry entries into the next cycle.
struct CycleReset<'a> {
    tracker: &'a Mutex<ChangeTracker>,
}

impl Drop for CycleReset<'_> {
    fn drop(&mut self) {
        lock_tracker(self.tracker).reset();
    }
}

/// Drives hook dispatch for one session.
#[derive(Debug)]
pub struct CommitLifecycle {
    session: SessionId,
    tracker: Arc<Mutex<ChangeTracker>>,
    state: LifecycleState,
    config: HooksConfig,
}

impl CommitLifecycle {
    pub fn new(session: SessionId, tracker: Arc<Mutex<ChangeTracker>>, config: HooksConfig) -> Self {
        Self {
            session,
            tracker,
            state: LifecycleState::Idle,
            config,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn outcome_pending(&self) -> bool {
        self.state.outcome_pending()
    }

    pub fn config(&self) -> &HooksConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<Mutex<ChangeTracker>> {
        &self.tracker
    }

    /// Pre-commit signal.
    ///
    /// Flushes the engine so every pending mutation has reached the
    /// listener, then dispatches the before bucket against the live
    /// transaction. The tracker stays locked until the outcome signal.
    pub fn before_commit<E: StorageEngine + ?Sized>(
        &mut self,
        engine: &mut E,
    ) -> Result<DispatchReport> {
        if self.config.flush_before_commit {
            engine.flush()?;
        }
        self.dispatch_before(engine.transaction_mut())
    }

    /// Mark the outcome pending, lock the tracker and dispatch the before
    /// bucket against `transaction`.
    ///
    /// Calling it again before the outcome signal dispatches nothing, the
    /// bucket having been cleared by the first call.
    pub fn dispatch_before(&mut self, transaction: &mut dyn QueryHandle) -> Result<DispatchReport> {
        self.state = LifecycleState::DispatchingBefore;
        lock_tracker(&self.tracker).lock();

        let report = dispatch_bucket(self.session, &self.tracker, Phase::Before, transaction)?;

        self.state = LifecycleState::AwaitingOutcome;
        Ok(report)
    }

    /// Post-commit signal. Fires only after the physical commit succeeded.
    ///
    /// The failed bucket is dropped without dispatch.
    pub fn after_commit<E: StorageEngine + ?Sized>(
        &mut self,
        engine: &mut E,
    ) -> Result<DispatchReport> {
        self.state = LifecycleState::Idle;
        let _reset = CycleReset {
            tracker: &self.tracker,
        };
        self.dispatch_scoped(engine, Phase::After)
    }

    /// Post-rollback signal, raised for every rollback including savepoint
    /// rollbacks.
    ///
    /// Returns `None` when no commit was attempted: nothing is dispatched
    /// and the buckets are kept, since a savepoint rollback leaves the outer
    /// transaction's changes in place. Otherwise the failed bucket is
    /// dispatched and the after bucket dropped.
    pub fn after_rollback<E: StorageEngine + ?Sized>(
        &mut self,
        engine: &mut E,
    ) -> Result<Option<DispatchReport>> {
        let pending = self.outcome_pending();
        self.state = LifecycleState::Idle;

        if !pending {
            lock_tracker(&self.tracker).unlock();
            debug!(session = %self.session, "rollback without commit attempt, no failed hooks");
            return Ok(None);
        }

        info!(session = %self.session, "commit failed, dispatching failed hooks");
        let _reset = CycleReset {
            tracker: &self.tracker,
        };
        self.dispatch_scoped(engine, Phase::Failed).map(Some)
    }

    /// Drop every queued entry without dispatch and unlock.
    ///
    /// Called after a full rollback with no commit attempt, whose changes
    /// never reach a commit.
    pub fn discard_pending(&self) {
        let mut tracker = lock_tracker(&self.tracker);
        let dropped: usize = Phase::ALL.iter().map(|phase| tracker.len(*phase)).sum();
        tracker.reset();
        debug!(session = %self.session, dropped, "discarded queued hooks");
    }

    fn dispatch_scoped<E: StorageEngine + ?Sized>(
        &self,
        engine: &mut E,
        phase: Phase,
    ) -> Result<DispatchReport> {
        if !self.config.scoped_queries {
            return dispatch_bucket(self.session, &self.tracker, phase, engine.transaction_mut());
        }

        let mut scope = ScopedQuery::enter(engine)?;
        let report = dispatch_bucket(self.session, &self.tracker, phase, scope.transaction());
        drop(scope);
        report
    }
}

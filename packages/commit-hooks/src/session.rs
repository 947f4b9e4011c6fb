//! Hosting session.
//!
//! `HookedSession` wraps a [`StorageEngine`] and raises the lifecycle
//! signals around its physical commit and rollback:
//!
//! ```text
//! commit()
//!   ├─ savepoint open?  engine.commit() releases it, no signals
//!   ├─ before_commit    flush + before hooks      (error → needs rollback)
//!   ├─ engine.commit()                            (error → needs rollback)
//!   └─ after_commit     after hooks in a scoped query
//!
//! rollback()
//!   ├─ engine.rollback()   innermost level
//!   ├─ after_rollback      failed hooks if a commit was attempted
//!   └─ discard_pending     no attempt and no savepoint: drop queued hooks
//! ```
//!
//! After a failed flush or commit the session refuses to flush or commit
//! again until [`rollback`](HookedSession::rollback) is called.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::HooksConfig;
use crate::core::{MutationKind, Phase, SessionId};
use crate::engine::StorageEngine;
use crate::entity::EntityRef;
use crate::error::SessionError;
use crate::lifecycle::{CommitLifecycle, LifecycleState};
use crate::listener::MutationListener;
use crate::tracker::{lock_tracker, ChangeTracker};

/// A storage session with commit hooks.
///
/// # Example
///
/// ```ignore
/// let listener = MutationListener::global();
/// let engine = PgEngine::connect(&pool, listener.clone()).await?;
/// let mut session = HookedSession::new(engine, listener);
///
/// session.add(Arc::new(Invoice::new(42)))?;
/// session.commit()?; // Invoice::after_commit_from_insert runs here
/// ```
pub struct HookedSession<E: StorageEngine> {
    id: SessionId,
    engine: E,
    listener: MutationListener,
    lifecycle: CommitLifecycle,
    needs_rollback: bool,
}

impl<E: StorageEngine> HookedSession<E> {
    pub fn new(engine: E, listener: MutationListener) -> Self {
        Self::with_config(engine, listener, HooksConfig::default())
    }

    pub fn with_config(mut engine: E, listener: MutationListener, config: HooksConfig) -> Self {
        let id = SessionId::new();
        let tracker = Arc::new(Mutex::new(ChangeTracker::new()));

        listener.attach(id, &tracker);
        engine.bind_session(id);
        debug!(session = %id, ?config, "session opened");

        Self {
            id,
            engine,
            listener,
            lifecycle: CommitLifecycle::new(id, tracker, config),
            needs_rollback: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// The engine's active transaction.
    pub fn query(&mut self) -> &mut E::Transaction {
        self.engine.transaction_mut()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn is_locked(&self) -> bool {
        lock_tracker(self.lifecycle.tracker()).is_locked()
    }

    /// Whether a failed flush or commit must be rolled back first.
    pub fn needs_rollback(&self) -> bool {
        self.needs_rollback
    }

    /// Queued (entity, kind) pairs for `phase`, in dispatch order.
    pub fn pending(&self, phase: Phase) -> Vec<(EntityRef, MutationKind)> {
        lock_tracker(self.lifecycle.tracker()).pending(phase)
    }

    pub fn add(&mut self, entity: impl Into<EntityRef>) -> Result<()> {
        self.engine.stage(entity.into(), MutationKind::Insert)
    }

    pub fn update(&mut self, entity: impl Into<EntityRef>) -> Result<()> {
        self.engine.stage(entity.into(), MutationKind::Update)
    }

    pub fn delete(&mut self, entity: impl Into<EntityRef>) -> Result<()> {
        self.engine.stage(entity.into(), MutationKind::Delete)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let result = self.engine.flush();
        self.mark_on_error(result)
    }

    /// Flush and open a savepoint.
    pub fn begin_nested(&mut self) -> Result<()> {
        self.ensure_usable()?;
        let result = self.engine.begin_nested();
        self.mark_on_error(result)
    }

    /// Commit, running before hooks ahead of the physical commit and after
    /// hooks once it succeeded.
    ///
    /// Engine and hook errors come back unchanged. An after-hook error is
    /// reported after the data is already committed.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_usable()?;

        if self.engine.in_nested() {
            let result = self.engine.commit();
            return self.mark_on_error(result);
        }

        let result = self.lifecycle.before_commit(&mut self.engine);
        let before = self.mark_on_error(result)?;

        info!(session = %self.id, before_hooks = before.fired, "committing");
        if let Err(err) = self.engine.commit() {
            warn!(session = %self.id, error = %err, "physical commit failed");
            self.needs_rollback = true;
            return Err(err);
        }

        let after = self.lifecycle.after_commit(&mut self.engine)?;
        debug!(session = %self.id, after_hooks = after.fired, "commit complete");
        Ok(())
    }

    /// Roll back the innermost level.
    ///
    /// Fires the failed hooks when a commit was attempted. Otherwise a full
    /// rollback discards the queued hooks, while a savepoint rollback keeps
    /// them for the outer transaction's commit. An engine rollback error is
    /// returned after the hooks ran; a hook error takes its place.
    pub fn rollback(&mut self) -> Result<()> {
        let savepoint = self.engine.in_nested();
        let result = self.engine.rollback();
        self.needs_rollback = false;
        info!(session = %self.id, savepoint, "rolled back");

        let report = match self.lifecycle.after_rollback(&mut self.engine) {
            Ok(report) => report,
            Err(err) => {
                if let Err(engine_err) = &result {
                    warn!(session = %self.id, error = %engine_err, "engine rollback failed");
                }
                return Err(err);
            }
        };

        if report.is_none() && !savepoint {
            self.lifecycle.discard_pending();
        }
        result
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.needs_rollback {
            return Err(SessionError::PendingRollback { session: self.id }.into());
        }
        Ok(())
    }

    fn mark_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.needs_rollback = true;
        }
        result
    }
}

impl<E: StorageEngine> Drop for HookedSession<E> {
    fn drop(&mut self) {
        self.listener.detach(self.id);
    }
}

//! Testing utilities for commit hooks.
//!
//! This module provides an in-memory [`StorageEngine`] and recording
//! entities, so hook behavior can be tested without a database.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! commit-hooks = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use commit_hooks::testing::{memory_session, CallLog, RecordingEntity};
//! use commit_hooks::{assert_hooks, HooksConfig};
//!
//! let log = CallLog::new();
//! let mut session = memory_session(HooksConfig::default());
//!
//! session.add(Arc::new(RecordingEntity::new("invoice", &log)))?;
//! session.commit()?;
//!
//! assert_hooks!(log, "invoice" => [
//!     "before_commit_from_insert",
//!     "after_commit_from_insert",
//! ]);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use thiserror::Error;

use crate::config::HooksConfig;
use crate::core::{HookSet, HookSlot, MutationKind, SessionId};
use crate::engine::{QueryHandle, StorageEngine};
use crate::entity::{CommitHooks, EntityRef, HookContext};
use crate::listener::{MutationEvent, MutationListener};
use crate::registry::HookRegistry;
use crate::session::HookedSession;

// =============================================================================
// Memory Engine
// =============================================================================

/// A flush rejected by the unique-key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("duplicate key {key}")]
pub struct DuplicateKey {
    pub key: u64,
}

#[derive(Debug, Clone)]
struct PendingChange {
    entity: EntityRef,
    kind: MutationKind,
    key: Option<u64>,
}

/// Transaction of the [`MemoryEngine`].
///
/// Holds its own copy of the rows. Queries fail once the transaction has
/// been committed or rolled back.
pub struct MemoryTransaction {
    id: u64,
    active: bool,
    rows: BTreeMap<u64, EntityRef>,
    pending: Vec<PendingChange>,
    savepoints: Vec<BTreeMap<u64, EntityRef>>,
    session: Option<SessionId>,
    listener: MutationListener,
    next_key: Arc<AtomicU64>,
}

impl MemoryTransaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Visible rows by key.
    pub fn rows(&self) -> Result<Vec<(u64, EntityRef)>> {
        self.ensure_active()?;
        Ok(self
            .rows
            .iter()
            .map(|(key, entity)| (*key, entity.clone()))
            .collect())
    }

    pub fn count(&self) -> Result<usize> {
        self.ensure_active()?;
        Ok(self.rows.len())
    }

    pub fn get(&self, key: u64) -> Result<Option<EntityRef>> {
        self.ensure_active()?;
        Ok(self.rows.get(&key).cloned())
    }

    /// Key under which `entity` is stored.
    pub fn key_of(&self, entity: &EntityRef) -> Result<Option<u64>> {
        self.ensure_active()?;
        Ok(find_key(&self.rows, entity))
    }

    /// Queue an insert with a generated key.
    pub fn insert(&mut self, entity: impl Into<EntityRef>) -> Result<()> {
        self.queue(entity.into(), MutationKind::Insert, None)
    }

    /// Queue an insert under an explicit key.
    pub fn insert_with_key(&mut self, key: u64, entity: impl Into<EntityRef>) -> Result<()> {
        self.queue(entity.into(), MutationKind::Insert, Some(key))
    }

    pub fn update(&mut self, entity: impl Into<EntityRef>) -> Result<()> {
        self.queue(entity.into(), MutationKind::Update, None)
    }

    pub fn delete(&mut self, entity: impl Into<EntityRef>) -> Result<()> {
        self.queue(entity.into(), MutationKind::Delete, None)
    }

    /// Apply queued changes and report each one to the listener.
    ///
    /// All-or-nothing: if any change is rejected none is applied, and the
    /// queue is discarded either way.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_active()?;
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(());
        }

        let mut rows = self.rows.clone();
        for change in &pending {
            match change.kind {
                MutationKind::Insert => {
                    let key = change
                        .key
                        .unwrap_or_else(|| self.next_key.fetch_add(1, Ordering::Relaxed));
                    if rows.contains_key(&key) {
                        return Err(DuplicateKey { key }.into());
                    }
                    rows.insert(key, change.entity.clone());
                }
                MutationKind::Update => {
                    if find_key(&rows, &change.entity).is_none() {
                        bail!("cannot update unsaved {}", change.entity.type_name());
                    }
                }
                MutationKind::Delete => {
                    let key = find_key(&rows, &change.entity).ok_or_else(|| {
                        anyhow!("cannot delete unsaved {}", change.entity.type_name())
                    })?;
                    rows.remove(&key);
                }
            }
        }

        self.rows = rows;
        for change in pending {
            self.listener
                .notify(MutationEvent::new(self.session, change.entity, change.kind));
        }
        Ok(())
    }

    fn queue(&mut self, entity: EntityRef, kind: MutationKind, key: Option<u64>) -> Result<()> {
        self.ensure_active()?;
        self.pending.push(PendingChange { entity, kind, key });
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if !self.active {
            bail!("transaction {} is closed", self.id);
        }
        Ok(())
    }
}

impl QueryHandle for MemoryTransaction {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

fn find_key(rows: &BTreeMap<u64, EntityRef>, entity: &EntityRef) -> Option<u64> {
    rows.iter()
        .find(|(_, row)| *row == entity)
        .map(|(key, _)| *key)
}

/// In-memory [`StorageEngine`] with a unique-key constraint, savepoints and
/// commit and rollback failure injection.
pub struct MemoryEngine {
    listener: MutationListener,
    session: Option<SessionId>,
    committed: BTreeMap<u64, EntityRef>,
    current: MemoryTransaction,
    next_key: Arc<AtomicU64>,
    next_txn: u64,
    fail_next_commit: Option<String>,
    fail_next_rollback: Option<String>,
}

impl MemoryEngine {
    pub fn new(listener: MutationListener) -> Self {
        let next_key = Arc::new(AtomicU64::new(1));
        let current = MemoryTransaction {
            id: 1,
            active: true,
            rows: BTreeMap::new(),
            pending: Vec::new(),
            savepoints: Vec::new(),
            session: None,
            listener: listener.clone(),
            next_key: next_key.clone(),
        };
        Self {
            listener,
            session: None,
            committed: BTreeMap::new(),
            current,
            next_key,
            next_txn: 2,
            fail_next_commit: None,
            fail_next_rollback: None,
        }
    }

    /// Make the next top-level commit fail after flushing.
    pub fn fail_next_commit(&mut self, reason: impl Into<String>) {
        self.fail_next_commit = Some(reason.into());
    }

    /// Make the next rollback report an error after undoing its level.
    pub fn fail_next_rollback(&mut self, reason: impl Into<String>) {
        self.fail_next_rollback = Some(reason.into());
    }

    /// Queue an insert under an explicit key.
    pub fn insert_with_key(&mut self, key: u64, entity: impl Into<EntityRef>) -> Result<()> {
        self.begin_if_closed();
        self.current.insert_with_key(key, entity)
    }

    /// Rows that survived a physical commit.
    pub fn committed(&self) -> Vec<(u64, EntityRef)> {
        self.committed
            .iter()
            .map(|(key, entity)| (*key, entity.clone()))
            .collect()
    }

    pub fn is_committed(&self, entity: &EntityRef) -> bool {
        find_key(&self.committed, entity).is_some()
    }

    /// Savepoint depth.
    pub fn depth(&self) -> usize {
        self.current.savepoints.len()
    }

    fn open_transaction(&mut self) -> MemoryTransaction {
        let id = self.next_txn;
        self.next_txn += 1;
        MemoryTransaction {
            id,
            active: true,
            rows: self.committed.clone(),
            pending: Vec::new(),
            savepoints: Vec::new(),
            session: self.session,
            listener: self.listener.clone(),
            next_key: self.next_key.clone(),
        }
    }

    fn begin_if_closed(&mut self) {
        if !self.current.active {
            self.current = self.open_transaction();
        }
    }
}

impl StorageEngine for MemoryEngine {
    type Transaction = MemoryTransaction;

    fn bind_session(&mut self, session: SessionId) {
        self.session = Some(session);
        self.current.session = Some(session);
    }

    fn stage(&mut self, entity: EntityRef, kind: MutationKind) -> Result<()> {
        self.begin_if_closed();
        self.current.queue(entity, kind, None)
    }

    fn flush(&mut self) -> Result<()> {
        self.begin_if_closed();
        self.current.flush()
    }

    fn commit(&mut self) -> Result<()> {
        self.begin_if_closed();
        self.current.flush()?;

        if self.current.savepoints.pop().is_some() {
            return Ok(());
        }

        if let Some(reason) = self.fail_next_commit.take() {
            bail!("commit failed: {reason}");
        }

        self.committed = self.current.rows.clone();
        self.current.active = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.current.pending.clear();
        match self.current.savepoints.pop() {
            Some(snapshot) => self.current.rows = snapshot,
            None => self.current.active = false,
        }

        if let Some(reason) = self.fail_next_rollback.take() {
            bail!("rollback failed: {reason}");
        }
        Ok(())
    }

    fn begin_nested(&mut self) -> Result<()> {
        self.begin_if_closed();
        self.current.flush()?;
        let snapshot = self.current.rows.clone();
        self.current.savepoints.push(snapshot);
        Ok(())
    }

    fn in_nested(&self) -> bool {
        !self.current.savepoints.is_empty()
    }

    fn transaction_mut(&mut self) -> &mut MemoryTransaction {
        &mut self.current
    }

    fn replace_transaction(&mut self, transaction: MemoryTransaction) -> MemoryTransaction {
        std::mem::replace(&mut self.current, transaction)
    }

    fn scratch_transaction(&mut self) -> Result<MemoryTransaction> {
        Ok(self.open_transaction())
    }
}

// =============================================================================
// Recording Entities
// =============================================================================

/// Shared record of hook invocations, in call order.
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<(String, HookSlot)>>,
}

impl CallLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, label: &str, slot: HookSlot) {
        self.entries().push((label.to_string(), slot));
    }

    pub fn calls(&self) -> Vec<(String, HookSlot)> {
        self.entries().clone()
    }

    /// Slots invoked on the entity labelled `label`, in order.
    pub fn slots_for(&self, label: &str) -> Vec<HookSlot> {
        self.entries()
            .iter()
            .filter(|(l, _)| l == label)
            .map(|(_, slot)| *slot)
            .collect()
    }

    /// Number of times `slot` ran on `label`.
    pub fn count(&self, label: &str, slot: HookSlot) -> usize {
        self.entries()
            .iter()
            .filter(|(l, s)| l == label && *s == slot)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<(String, HookSlot)>> {
        match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Error returned by a [`RecordingEntity`] told to fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{label} refused {slot}")]
pub struct HookRefused {
    pub label: String,
    pub slot: HookSlot,
}

/// Extra work a [`RecordingEntity`] does inside each hook.
pub type HookProbe = Box<dyn Fn(&mut HookContext<'_>) -> Result<()> + Send + Sync>;

/// Entity implementing all nine hooks by logging them.
pub struct RecordingEntity {
    label: String,
    log: Arc<CallLog>,
    fail_on: Option<HookSlot>,
    probe: Option<HookProbe>,
}

impl RecordingEntity {
    pub fn new(label: impl Into<String>, log: &Arc<CallLog>) -> Self {
        Self {
            label: label.into(),
            log: log.clone(),
            fail_on: None,
            probe: None,
        }
    }

    /// Return [`HookRefused`] from `slot`, after logging it.
    pub fn failing_on(mut self, slot: HookSlot) -> Self {
        self.fail_on = Some(slot);
        self
    }

    /// Run `probe` inside every hook, after logging it.
    pub fn with_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn(&mut HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.probe = Some(Box::new(probe));
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn hit(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        let slot = ctx.slot();
        self.log.push(&self.label, slot);
        if self.fail_on == Some(slot) {
            return Err(HookRefused {
                label: self.label.clone(),
                slot,
            }
            .into());
        }
        match &self.probe {
            Some(probe) => probe(ctx),
            None => Ok(()),
        }
    }
}

impl CommitHooks for RecordingEntity {
    fn before_commit_from_insert(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.hit(ctx)
    }

    fn before_commit_from_update(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.hit(ctx)
    }

    fn before_commit_from_delete(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.hit(ctx)
    }

    fn after_commit_from_insert(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.hit(ctx)
    }

    fn after_commit_from_update(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.hit(ctx)
    }

    fn after_commit_from_delete(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.hit(ctx)
    }

    fn failed_commit_from_insert(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.hit(ctx)
    }

    fn failed_commit_from_update(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.hit(ctx)
    }

    fn failed_commit_from_delete(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        self.hit(ctx)
    }
}

/// A registry with [`RecordingEntity`] subscribed to every slot.
pub fn recording_registry() -> Arc<HookRegistry> {
    let registry = HookRegistry::new();
    registry.register::<RecordingEntity>(HookSet::all());
    Arc::new(registry)
}

/// A session over a fresh [`MemoryEngine`] and [`recording_registry`].
pub fn memory_session(config: HooksConfig) -> HookedSession<MemoryEngine> {
    let listener = MutationListener::new(recording_registry());
    let engine = MemoryEngine::new(listener.clone());
    HookedSession::with_config(engine, listener, config)
}

/// Asserts the exact hook sequence an entity received.
///
/// Slots are given by method name.
///
/// # Panics
///
/// Panics if a name does not parse or the sequence differs.
#[macro_export]
macro_rules! assert_hooks {
    ($log:expr, $label:expr => [$($slot:expr),* $(,)?]) => {{
        let expected: Vec<$crate::HookSlot> = vec![
            $($slot.parse::<$crate::HookSlot>().expect("hook name")),*
        ];
        let actual = $log.slots_for($label);
        assert_eq!(
            actual, expected,
            "Unexpected hooks for {:?}\n  expected: {:?}\n  actual: {:?}",
            $label, expected, actual
        );
    }};
}

pub use assert_hooks;

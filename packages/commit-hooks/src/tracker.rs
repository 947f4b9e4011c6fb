//! Per-session change tracker.
//!
//! The tracker records, for the current commit attempt, which entities
//! changed and how, once per phase. Each phase has its own bucket:
//!
//! - buckets are ordered by first insertion of an entity
//! - kinds are deduplicated per entity (five updates to one entity within a
//!   flush cycle are one `update` entry)
//!
//! # The lock
//!
//! While the tracker is locked, [`record`](ChangeTracker::record) discards
//! its input. The lifecycle locks the tracker for the whole span from
//! before-dispatch to the end of after/failed dispatch, so mutations caused
//! by hooks themselves are never attributed to the commit being dispatched.

use std::sync::{Mutex, MutexGuard};

use indexmap::IndexMap;
use tracing::warn;

use crate::core::{KindSet, MutationKind, Phase};
use crate::entity::{EntityKey, EntityRef};

/// An entity and the kinds recorded for it in one bucket.
#[derive(Debug, Clone)]
pub struct TrackedEntity {
    pub entity: EntityRef,
    pub kinds: KindSet,
}

#[derive(Debug, Default)]
struct Bucket {
    entries: IndexMap<EntityKey, TrackedEntity>,
}

impl Bucket {
    fn record(&mut self, entity: &EntityRef, kind: MutationKind) {
        self.entries
            .entry(entity.key())
            .or_insert_with(|| TrackedEntity {
                entity: entity.clone(),
                kinds: KindSet::empty(),
            })
            .kinds
            .insert(kind);
    }

    fn complete(&mut self, entity: &EntityRef, kind: MutationKind) {
        let key = entity.key();
        let now_empty = match self.entries.get_mut(&key) {
            Some(tracked) => {
                tracked.kinds.remove(kind);
                tracked.kinds.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.entries.shift_remove(&key);
        }
    }

    /// Kind-major, then insertion order.
    fn pending(&self) -> Vec<(EntityRef, MutationKind)> {
        let mut plan = Vec::new();
        for kind in MutationKind::DISPATCH_ORDER {
            for tracked in self.entries.values() {
                if tracked.kinds.contains(kind) {
                    plan.push((tracked.entity.clone(), kind));
                }
            }
        }
        plan
    }
}

/// Changes recorded for one session's current commit attempt.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    locked: bool,
    before: Bucket,
    after: Bucket,
    failed: Bucket,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    /// Record `kind` for `entity` in the `phase` bucket.
    ///
    /// Returns `false` when the tracker is locked and the write was
    /// discarded.
    pub fn record(&mut self, entity: &EntityRef, phase: Phase, kind: MutationKind) -> bool {
        if self.locked {
            return false;
        }
        self.bucket_mut(phase).record(entity, kind);
        true
    }

    /// Queued (entity, kind) pairs for `phase`, in dispatch order.
    pub fn pending(&self, phase: Phase) -> Vec<(EntityRef, MutationKind)> {
        self.bucket(phase).pending()
    }

    /// Kinds recorded for `entity` in `phase`.
    pub fn kinds_for(&self, phase: Phase, entity: &EntityRef) -> KindSet {
        self.bucket(phase)
            .entries
            .get(&entity.key())
            .map(|tracked| tracked.kinds)
            .unwrap_or_default()
    }

    /// Tracked entities in `phase`, in insertion order.
    pub fn entities(&self, phase: Phase) -> Vec<TrackedEntity> {
        self.bucket(phase).entries.values().cloned().collect()
    }

    /// Number of tracked entities in `phase`.
    pub fn len(&self, phase: Phase) -> usize {
        self.bucket(phase).entries.len()
    }

    pub fn is_empty(&self, phase: Phase) -> bool {
        self.bucket(phase).entries.is_empty()
    }

    /// Drop one (entity, kind) pair once its hook has run.
    pub(crate) fn complete(&mut self, phase: Phase, entity: &EntityRef, kind: MutationKind) {
        self.bucket_mut(phase).complete(entity, kind);
    }

    pub fn clear(&mut self, phase: Phase) {
        self.bucket_mut(phase).entries.clear();
    }

    /// Empty every bucket and release the lock.
    pub fn reset(&mut self) {
        for phase in Phase::ALL {
            self.clear(phase);
        }
        self.locked = false;
    }

    fn bucket(&self, phase: Phase) -> &Bucket {
        match phase {
            Phase::Before => &self.before,
            Phase::After => &self.after,
            Phase::Failed => &self.failed,
        }
    }

    fn bucket_mut(&mut self, phase: Phase) -> &mut Bucket {
        match phase {
            Phase::Before => &mut self.before,
            Phase::After => &mut self.after,
            Phase::Failed => &mut self.failed,
        }
    }
}

/// Lock a shared tracker, recovering from poisoning.
///
/// Never hold the guard across a hook call.
pub(crate) fn lock_tracker(tracker: &Mutex<ChangeTracker>) -> MutexGuard<'_, ChangeTracker> {
    match tracker.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("change tracker mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

//! Mutation listener - the bridge from engine flush events to trackers.
//!
//! The engine calls [`MutationListener::notify`] synchronously for every
//! insert, update and delete it performs while flushing. The listener:
//!
//! 1. Looks up which phases the entity's type subscribed to for that kind
//! 2. Resolves the owning session's tracker
//! 3. Records the kind in each subscribed phase's bucket
//!
//! Every step that can come up empty is a silent no-op: an unregistered
//! type, an event without a session, a session that was dropped, a locked
//! tracker. Flush regularly happens outside any tracked context, so none of
//! these are errors.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::core::{HookSlot, MutationKind, Phase, SessionId};
use crate::entity::EntityRef;
use crate::registry::HookRegistry;
use crate::tracker::{lock_tracker, ChangeTracker};

/// One row mutation performed by the engine during flush.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    /// Session owning the entity, if the engine knows one.
    pub session: Option<SessionId>,
    pub entity: EntityRef,
    pub kind: MutationKind,
}

impl MutationEvent {
    pub fn new(session: Option<SessionId>, entity: EntityRef, kind: MutationKind) -> Self {
        Self {
            session,
            entity,
            kind,
        }
    }
}

static GLOBAL: OnceLock<MutationListener> = OnceLock::new();

struct ListenerInner {
    registry: Arc<HookRegistry>,
    sessions: DashMap<SessionId, Weak<Mutex<ChangeTracker>>>,
}

/// Routes engine mutation events into session trackers.
///
/// Cheap to clone; all clones share the same session directory.
#[derive(Clone)]
pub struct MutationListener {
    inner: Arc<ListenerInner>,
}

impl MutationListener {
    pub fn new(registry: Arc<HookRegistry>) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                registry,
                sessions: DashMap::new(),
            }),
        }
    }

    /// The process-wide listener, over [`HookRegistry::global`].
    ///
    /// Every call returns a clone of the same listener, so an engine and a
    /// session built from separate calls share one session directory.
    pub fn global() -> Self {
        GLOBAL
            .get_or_init(|| Self::new(HookRegistry::global()))
            .clone()
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.inner.registry
    }

    /// Make `tracker` reachable for events tagged with `session`.
    pub fn attach(&self, session: SessionId, tracker: &Arc<Mutex<ChangeTracker>>) {
        self.inner.sessions.insert(session, Arc::downgrade(tracker));
    }

    pub fn detach(&self, session: SessionId) {
        self.inner.sessions.remove(&session);
    }

    /// Number of attached sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Handle one engine event.
    pub fn notify(&self, event: MutationEvent) {
        let phases = self
            .inner
            .registry
            .phases_for(event.entity.type_id(), event.kind);
        if phases.is_empty() {
            return;
        }

        let Some(tracker) = self.resolve(event.session) else {
            return;
        };

        let mut tracker = lock_tracker(&tracker);
        for phase in phases {
            Self::record_into(&mut tracker, &event.entity, phase, event.kind);
        }
    }

    /// Record a single (phase, kind) for an entity.
    ///
    /// No-op unless the entity's type declared that slot.
    pub fn record(
        &self,
        session: Option<SessionId>,
        entity: &EntityRef,
        phase: Phase,
        kind: MutationKind,
    ) {
        let slot = HookSlot::new(phase, kind);
        if !self.inner.registry.is_declared(entity.type_id(), slot) {
            return;
        }

        let Some(tracker) = self.resolve(session) else {
            return;
        };

        Self::record_into(&mut lock_tracker(&tracker), entity, phase, kind);
    }

    fn record_into(
        tracker: &mut ChangeTracker,
        entity: &EntityRef,
        phase: Phase,
        kind: MutationKind,
    ) {
        if !tracker.record(entity, phase, kind) {
            debug!(
                entity = entity.type_name(),
                %phase,
                %kind,
                "tracker locked, discarding mutation"
            );
        }
    }

    fn resolve(&self, session: Option<SessionId>) -> Option<Arc<Mutex<ChangeTracker>>> {
        let Some(session) = session else {
            trace!("mutation without owning session, not tracked");
            return None;
        };

        let weak = self.inner.sessions.get(&session)?.value().clone();
        match weak.upgrade() {
            Some(tracker) => Some(tracker),
            None => {
                trace!(%session, "session dropped, detaching");
                self.inner.sessions.remove(&session);
                None
            }
        }
    }
}

impl std::fmt::Debug for MutationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationListener")
            .field("sessions", &self.inner.sessions.len())
            .field("registered_types", &self.inner.registry.len())
            .finish()
    }
}

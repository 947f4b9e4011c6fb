//! Entity-side contract: the [`CommitHooks`] trait and entity handles.
//!
//! An entity type implements whichever of the nine hook methods it cares
//! about and declares them in a [`HookSet`](crate::HookSet) at registration.
//! Methods left at their default body are never called, because undeclared
//! slots are never tracked.
//!
//! # Example
//!
//! ```ignore
//! use commit_hooks::{CommitHooks, HookContext, HookRegistry, HookSet, MutationKind, Phase};
//!
//! struct Invoice {
//!     number: u64,
//!     mailer: Mailer,
//! }
//!
//! impl CommitHooks for Invoice {
//!     fn after_commit_from_insert(&self, _ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
//!         self.mailer.send_invoice(self.number)
//!     }
//! }
//!
//! registry.register::<Invoice>(HookSet::new().with(Phase::After, MutationKind::Insert));
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;

use crate::core::{HookSlot, MutationKind, Phase, SessionId};
use crate::engine::QueryHandle;

// =============================================================================
// Commit Hooks Trait
// =============================================================================

/// Callbacks an entity receives around commit.
///
/// Hooks take `&self`. Entities that need to mutate state from a hook use
/// interior mutability. Returning `Err` aborts the rest of the dispatch pass
/// and surfaces from `commit()`/`rollback()` unchanged.
pub trait CommitHooks: Any + Send + Sync {
    fn before_commit_from_insert(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_commit_from_update(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn before_commit_from_delete(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_commit_from_insert(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_commit_from_update(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn after_commit_from_delete(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn failed_commit_from_insert(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn failed_commit_from_update(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }

    fn failed_commit_from_delete(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Route a slot to the matching trait method.
fn invoke_slot(entity: &dyn CommitHooks, ctx: &mut HookContext<'_>) -> Result<()> {
    match (ctx.phase(), ctx.kind()) {
        (Phase::Before, MutationKind::Insert) => entity.before_commit_from_insert(ctx),
        (Phase::Before, MutationKind::Update) => entity.before_commit_from_update(ctx),
        (Phase::Before, MutationKind::Delete) => entity.before_commit_from_delete(ctx),
        (Phase::After, MutationKind::Insert) => entity.after_commit_from_insert(ctx),
        (Phase::After, MutationKind::Update) => entity.after_commit_from_update(ctx),
        (Phase::After, MutationKind::Delete) => entity.after_commit_from_delete(ctx),
        (Phase::Failed, MutationKind::Insert) => entity.failed_commit_from_insert(ctx),
        (Phase::Failed, MutationKind::Update) => entity.failed_commit_from_update(ctx),
        (Phase::Failed, MutationKind::Delete) => entity.failed_commit_from_delete(ctx),
    }
}

// =============================================================================
// Hook Context
// =============================================================================

/// What a hook sees while it runs.
///
/// The transaction behind [`query`](Self::query) is the live one during the
/// before phase, and a disposable scoped one during after/failed dispatch.
pub struct HookContext<'a> {
    session: SessionId,
    slot: HookSlot,
    transaction: &'a mut dyn QueryHandle,
}

impl<'a> HookContext<'a> {
    pub fn new(session: SessionId, slot: HookSlot, transaction: &'a mut dyn QueryHandle) -> Self {
        Self {
            session,
            slot,
            transaction,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn slot(&self) -> HookSlot {
        self.slot
    }

    pub fn phase(&self) -> Phase {
        self.slot.phase
    }

    pub fn kind(&self) -> MutationKind {
        self.slot.kind
    }

    /// The engine's transaction, downcast to its concrete type.
    ///
    /// Returns `None` if `T` is not the engine's transaction type.
    pub fn query<T: QueryHandle>(&mut self) -> Option<&mut T> {
        self.transaction.as_any_mut().downcast_mut::<T>()
    }

    /// The engine's transaction as a trait object.
    pub fn transaction(&mut self) -> &mut dyn QueryHandle {
        &mut *self.transaction
    }
}

impl fmt::Debug for HookContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookContext")
            .field("session", &self.session)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Entity Handles
// =============================================================================

/// Identity of a tracked entity: the address of its shared allocation.
///
/// Stable for as long as any [`EntityRef`] to the entity is alive, which the
/// tracker guarantees by holding one for every tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(usize);

/// Shared, type-erased handle to an entity.
///
/// Equality and hashing use object identity, never field values, so an
/// entity without a primary key is still trackable.
#[derive(Clone)]
pub struct EntityRef {
    hooks: Arc<dyn CommitHooks>,
    any: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl EntityRef {
    pub fn new<T: CommitHooks>(entity: Arc<T>) -> Self {
        Self {
            hooks: entity.clone(),
            any: entity,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey(Arc::as_ptr(&self.any) as *const () as usize)
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Recover the concrete entity.
    pub fn downcast<T: CommitHooks>(&self) -> Option<Arc<T>> {
        self.any.clone().downcast::<T>().ok()
    }

    pub fn is<T: CommitHooks>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Run the hook for the context's slot.
    pub(crate) fn invoke(&self, ctx: &mut HookContext<'_>) -> Result<()> {
        invoke_slot(self.hooks.as_ref(), ctx)
    }
}

impl<T: CommitHooks> From<Arc<T>> for EntityRef {
    fn from(entity: Arc<T>) -> Self {
        EntityRef::new(entity)
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("type", &self.type_name)
            .field("key", &self.key())
            .finish()
    }
}

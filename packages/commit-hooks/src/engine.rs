//! Storage engine adapter and the scoped query context.
//!
//! The commit-hook core does not implement transactions. It drives an
//! engine through [`StorageEngine`] and only needs to know when flush,
//! commit and rollback happen, plus a way to put a query-capable
//! transaction in front of hooks once the real one has concluded.
//!
//! # Scoped queries
//!
//! After/failed hooks run once the physical commit or rollback is over. At
//! that point the engine's transaction is closed and refuses queries.
//! [`ScopedQuery`] swaps a disposable scratch transaction in for the
//! duration of dispatch and puts the original back when dropped, on every
//! exit path including a failing hook. The scratch transaction is
//! discarded, never committed.
//!
//! ```text
//! commit()
//!   → engine.commit()           (transaction closes)
//!   → ScopedQuery::enter()      (scratch swapped in)
//!       → after hooks query through scratch
//!   → drop(ScopedQuery)         (original restored, scratch discarded)
//! ```

use std::any::Any;

use anyhow::Result;
use tracing::trace;

use crate::core::{MutationKind, SessionId};
use crate::entity::EntityRef;

/// A transaction handle hooks can query through.
///
/// Hooks downcast it to the engine's concrete type with
/// [`HookContext::query`](crate::HookContext::query).
pub trait QueryHandle: Any + Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Whether the handle currently accepts queries.
    fn is_active(&self) -> bool {
        true
    }
}

/// The storage engine seen from the commit-hook core.
///
/// Implementations must report every insert, update and delete performed
/// during flush to the [`MutationListener`](crate::MutationListener) they
/// were built with, tagged with the session bound via
/// [`bind_session`](Self::bind_session).
pub trait StorageEngine {
    type Transaction: QueryHandle;

    /// Associate the engine with the session that owns its entities.
    fn bind_session(&mut self, session: SessionId);

    /// Queue a change to be written on the next flush.
    fn stage(&mut self, entity: EntityRef, kind: MutationKind) -> Result<()>;

    /// Write pending changes, reporting each one to the listener.
    fn flush(&mut self) -> Result<()>;

    /// Physically commit. With a savepoint open, release it instead.
    fn commit(&mut self) -> Result<()>;

    /// Roll back the innermost level: a savepoint if one is open, otherwise
    /// the whole transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Flush and open a savepoint.
    fn begin_nested(&mut self) -> Result<()>;

    /// Whether a savepoint is open.
    fn in_nested(&self) -> bool;

    /// The active transaction.
    fn transaction_mut(&mut self) -> &mut Self::Transaction;

    /// Install `transaction` as active and hand back the previous one.
    fn replace_transaction(&mut self, transaction: Self::Transaction) -> Self::Transaction;

    /// A fresh, disposable transaction that can serve queries but is never
    /// committed.
    fn scratch_transaction(&mut self) -> Result<Self::Transaction>;
}

/// RAII guard repointing the engine at a scratch transaction.
pub struct ScopedQuery<'a, E: StorageEngine + ?Sized> {
    engine: &'a mut E,
    original: Option<E::Transaction>,
}

impl<'a, E: StorageEngine + ?Sized> ScopedQuery<'a, E> {
    /// Swap a scratch transaction in. The original comes back on drop.
    pub fn enter(engine: &'a mut E) -> Result<Self> {
        let scratch = engine.scratch_transaction()?;
        let original = engine.replace_transaction(scratch);
        trace!("entered scoped query context");
        Ok(Self {
            engine,
            original: Some(original),
        })
    }

    /// The scratch transaction.
    pub fn transaction(&mut self) -> &mut E::Transaction {
        self.engine.transaction_mut()
    }
}

impl<E: StorageEngine + ?Sized> Drop for ScopedQuery<'_, E> {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            let scratch = self.engine.replace_transaction(original);
            drop(scratch);
            trace!("left scoped query context");
        }
    }
}

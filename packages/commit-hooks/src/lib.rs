//! # Commit Hooks
//!
//! Before, after and failed commit callbacks for entities, driven by a
//! storage session's commit lifecycle.
//!
//! ## Core Concepts
//!
//! An entity type opts into any of nine hooks, one per
//! (phase, mutation kind) pair:
//!
//! - **Phase**: `before` (ahead of the physical commit), `after` (commit
//!   succeeded), `failed` (commit attempted, then rolled back)
//! - **Kind**: `insert`, `update`, `delete`
//!
//! The hook `after_commit_from_insert` runs once per entity per commit in
//! which the entity was inserted, however many times it was flushed.
//!
//! ## Architecture
//!
//! ```text
//! HookRegistry (type → declared hooks)
//!     │
//!     ▼ phases_for(type, kind)
//! engine flush ──► MutationListener.notify()
//!                      │
//!                      ▼ record (dropped while locked)
//!                  ChangeTracker ── before │ after │ failed buckets
//!                      ▲
//!                      │ dispatch_bucket (insert → update → delete)
//!                      │
//! HookedSession ─► CommitLifecycle
//!   commit()          before_commit   flush, lock, before hooks
//!                     engine.commit()
//!                     after_commit    after hooks in ScopedQuery, unlock
//!   rollback()        after_rollback  failed hooks if commit was attempted
//! ```
//!
//! ## Key Invariants
//!
//! 1. **At most once per cycle** - an entity's kinds are deduplicated per bucket
//! 2. **Inserts first** - dispatch is kind-major, insertion ordered within a kind
//! 3. **Locked while dispatching** - mutations caused by hooks are not tracked
//! 4. **Exclusive outcome** - a cycle ends in after hooks or failed hooks, never both
//! 5. **No premature failure** - a rollback with no commit attempt fires nothing
//! 6. **Errors are not swallowed** - a hook error reaches the caller unchanged
//!
//! ## Example
//!
//! ```ignore
//! use commit_hooks::{
//!     CommitHooks, HookContext, HookRegistry, HookSet, HookedSession, MutationListener,
//! };
//!
//! struct Invoice {
//!     number: u64,
//! }
//!
//! impl CommitHooks for Invoice {
//!     fn after_commit_from_insert(&self, ctx: &mut HookContext<'_>) -> anyhow::Result<()> {
//!         let txn = ctx.query::<PgTransaction>().expect("pg transaction");
//!         txn.execute("INSERT INTO outbox ...", &[&self.number])?;
//!         Ok(())
//!     }
//! }
//!
//! HookRegistry::global().register_names::<Invoice, _>(&["after_commit_from_insert"])?;
//!
//! let listener = MutationListener::global();
//! let mut session = HookedSession::new(PgEngine::new(pool, listener.clone()), listener);
//! session.add(Arc::new(Invoice { number: 42 }))?;
//! session.commit()?;
//! ```

// Core modules
mod config;
mod core;
mod dispatch;
mod engine;
mod entity;
mod error;
mod lifecycle;
mod listener;
mod registry;
mod session;
mod tracker;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Commit scenarios (test-only)
#[cfg(test)]
mod lifecycle_tests;

// Re-export core types
pub use crate::core::{HookSet, HookSlot, KindSet, MutationKind, Phase, SessionId};

// Re-export entity contract
pub use entity::{CommitHooks, EntityKey, EntityRef, HookContext};

// Re-export error types
pub use crate::error::{HookConfigError, SessionError};

// Re-export tracking
pub use listener::{MutationEvent, MutationListener};
pub use registry::HookRegistry;
pub use tracker::{ChangeTracker, TrackedEntity};

// Re-export lifecycle
pub use config::HooksConfig;
pub use dispatch::DispatchReport;
pub use engine::{QueryHandle, ScopedQuery, StorageEngine};
pub use lifecycle::{CommitLifecycle, LifecycleState};
pub use session::HookedSession;

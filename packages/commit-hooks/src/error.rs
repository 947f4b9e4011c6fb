//! Structured error types for commit hooks.
//!
//! Two families of errors are defined here:
//!
//! - [`HookConfigError`]: raised while declaring hooks for an entity type.
//!   These are fatal at declaration time and never occur during a commit.
//! - [`SessionError`]: misuse of a [`HookedSession`](crate::HookedSession)
//!   after a failed flush or commit.
//!
//! Engine failures and hook failures are *not* wrapped. They travel as the
//! `anyhow::Error` the engine or hook produced, so callers can downcast to
//! their own types exactly as they would for a plain commit error.

use thiserror::Error;

use crate::core::SessionId;

/// Error in a hook declaration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookConfigError {
    /// The name does not follow `{phase}_commit_from_{kind}`.
    #[error("hook name {name:?} does not match {{phase}}_commit_from_{{kind}}")]
    UnknownHook { name: String },

    /// The phase part of a hook name is not `before`, `after` or `failed`.
    #[error("unknown commit phase {phase:?}")]
    UnknownPhase { phase: String },

    /// The kind part of a hook name is not `insert`, `update` or `delete`.
    #[error("unknown mutation kind {kind:?}")]
    UnknownKind { kind: String },

    /// Hooks were already registered for this entity type.
    #[error("commit hooks already registered for entity type {type_name}")]
    AlreadyRegistered { type_name: &'static str },
}

/// Error raised by a hosting session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A previous flush or commit failed and `rollback()` has not been called.
    #[error("session {session} has a failed flush or commit; call rollback() first")]
    PendingRollback { session: SessionId },
}

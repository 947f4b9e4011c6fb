//! Bucket dispatch.
//!
//! Runs every queued hook of one phase in the fixed order:
//!
//! ```text
//! for kind in [insert, update, delete]:
//!     for entity in bucket (insertion order):
//!         if kind in entity.kinds:
//!             entity.{phase}_commit_from_{kind}(ctx)
//! ```
//!
//! The order is by kind first, not by when each change was flushed, so all
//! insert hooks (and whatever keys inserts assign) are settled before any
//! update or delete hook runs.
//!
//! The tracker mutex is only held between hook calls. Each pair leaves the
//! bucket right after its hook returns `Ok`; a failing hook stops the pass
//! and leaves the remaining pairs queued.

use std::sync::Mutex;

use anyhow::Result;
use tracing::{debug, trace, warn};

use crate::core::{HookSlot, Phase, SessionId};
use crate::engine::QueryHandle;
use crate::entity::HookContext;
use crate::tracker::{lock_tracker, ChangeTracker};

/// What a dispatch pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub phase: Phase,
    /// Number of hooks invoked.
    pub fired: usize,
}

impl DispatchReport {
    pub fn empty(phase: Phase) -> Self {
        Self { phase, fired: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.fired == 0
    }
}

/// Dispatch and clear the `phase` bucket.
///
/// Hook errors propagate unchanged.
pub(crate) fn dispatch_bucket(
    session: SessionId,
    tracker: &Mutex<ChangeTracker>,
    phase: Phase,
    transaction: &mut dyn QueryHandle,
) -> Result<DispatchReport> {
    let plan = lock_tracker(tracker).pending(phase);
    if plan.is_empty() {
        return Ok(DispatchReport::empty(phase));
    }

    let mut fired = 0;
    for (entity, kind) in plan {
        let slot = HookSlot::new(phase, kind);
        trace!(%session, entity = entity.type_name(), hook = %slot, "invoking commit hook");

        let mut ctx = HookContext::new(session, slot, &mut *transaction);
        if let Err(err) = entity.invoke(&mut ctx) {
            warn!(
                %session,
                entity = entity.type_name(),
                hook = %slot,
                error = %err,
                "commit hook failed, aborting dispatch"
            );
            return Err(err);
        }

        lock_tracker(tracker).complete(phase, &entity, kind);
        fired += 1;
    }

    lock_tracker(tracker).clear(phase);
    debug!(%session, %phase, fired, "dispatched commit hooks");

    Ok(DispatchReport { phase, fired })
}

//! End-to-end commit scenarios against the in-memory engine.
//!
//! These tests drive full sessions through good commits, failing commits,
//! savepoints and misbehaving hooks.

#[cfg(test)]
mod lifecycle_tests {
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;

    use crate::assert_hooks;
    use crate::config::HooksConfig;
    use crate::core::{HookSet, HookSlot, MutationKind, Phase};
    use crate::engine::{QueryHandle, StorageEngine};
    use crate::entity::{EntityRef, HookContext};
    use crate::error::SessionError;
    use crate::lifecycle::LifecycleState;
    use crate::listener::MutationListener;
    use crate::registry::HookRegistry;
    use crate::session::HookedSession;
    use crate::testing::{
        memory_session, CallLog, DuplicateKey, HookRefused, MemoryEngine, MemoryTransaction,
        RecordingEntity,
    };

    // ==========================================================================
    // Helpers
    // ==========================================================================

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn session() -> HookedSession<MemoryEngine> {
        init_tracing();
        memory_session(HooksConfig::default())
    }

    fn entity(label: &str, log: &Arc<CallLog>) -> EntityRef {
        EntityRef::from(Arc::new(RecordingEntity::new(label, log)))
    }

    fn slot(phase: Phase, kind: MutationKind) -> HookSlot {
        HookSlot::new(phase, kind)
    }

    fn phase_calls(log: &CallLog, phase: Phase) -> Vec<(String, MutationKind)> {
        log.calls()
            .into_iter()
            .filter(|(_, slot)| slot.phase == phase)
            .map(|(label, slot)| (label, slot.kind))
            .collect()
    }

    fn transaction<'a>(ctx: &'a mut HookContext<'_>) -> anyhow::Result<&'a mut MemoryTransaction> {
        ctx.query::<MemoryTransaction>()
            .ok_or_else(|| anyhow!("hook not running on a memory transaction"))
    }

    // ==========================================================================
    // Basic Cycles
    // ==========================================================================

    #[test]
    fn test_insert_fires_before_and_after() {
        let log = CallLog::new();
        let mut session = session();

        session.add(entity("data", &log)).unwrap();
        session.commit().unwrap();

        assert_hooks!(log, "data" => [
            "before_commit_from_insert",
            "after_commit_from_insert",
        ]);
        assert_eq!(session.state(), LifecycleState::Idle);
        assert!(!session.is_locked());
    }

    #[test]
    fn test_insert_then_delete_across_two_commits() {
        let log = CallLog::new();
        let mut session = session();
        let data = entity("data", &log);

        session.add(data.clone()).unwrap();
        session.commit().unwrap();
        session.delete(data.clone()).unwrap();
        session.commit().unwrap();

        assert_hooks!(log, "data" => [
            "before_commit_from_insert",
            "after_commit_from_insert",
            "before_commit_from_delete",
            "after_commit_from_delete",
        ]);
        assert!(!session.engine().is_committed(&data));
    }

    #[test]
    fn test_repeated_updates_dispatch_once() {
        let log = CallLog::new();
        let mut session = session();
        let data = entity("data", &log);
        session.add(data.clone()).unwrap();
        session.commit().unwrap();
        log.clear();

        for _ in 0..3 {
            session.update(data.clone()).unwrap();
            session.flush().unwrap();
        }
        session.commit().unwrap();

        assert_eq!(log.count("data", slot(Phase::Before, MutationKind::Update)), 1);
        assert_eq!(log.count("data", slot(Phase::After, MutationKind::Update)), 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_inserts_dispatch_before_earlier_deletes() {
        let log = CallLog::new();
        let mut session = session();
        let old = entity("old", &log);
        session.add(old.clone()).unwrap();
        session.commit().unwrap();
        log.clear();

        session.delete(old).unwrap();
        session.flush().unwrap();
        session.add(entity("new", &log)).unwrap();
        session.commit().unwrap();

        assert_eq!(
            phase_calls(&log, Phase::Before),
            vec![
                ("new".to_string(), MutationKind::Insert),
                ("old".to_string(), MutationKind::Delete),
            ]
        );
        assert_eq!(
            phase_calls(&log, Phase::After),
            vec![
                ("new".to_string(), MutationKind::Insert),
                ("old".to_string(), MutationKind::Delete),
            ]
        );
    }

    #[test]
    fn test_multiple_good_commits() {
        let log = CallLog::new();
        let mut session = session();

        session.add(entity("data1", &log)).unwrap();
        session.commit().unwrap();
        session.add(entity("data2", &log)).unwrap();
        session.commit().unwrap();

        for label in ["data1", "data2"] {
            assert_hooks!(log, label => [
                "before_commit_from_insert",
                "after_commit_from_insert",
            ]);
        }
    }

    // ==========================================================================
    // Failing Commits
    // ==========================================================================

    #[test]
    fn test_failed_commit_fires_failed_not_after() {
        let log = CallLog::new();
        let mut session = session();
        let data = entity("data", &log);

        session.add(data.clone()).unwrap();
        session.engine_mut().fail_next_commit("disk full");
        let err = session.commit().unwrap_err();
        assert!(err.to_string().contains("disk full"));

        // nothing fires until the rollback
        assert_hooks!(log, "data" => ["before_commit_from_insert"]);

        session.rollback().unwrap();

        assert_hooks!(log, "data" => [
            "before_commit_from_insert",
            "failed_commit_from_insert",
        ]);
        assert!(!session.engine().is_committed(&data));
        for phase in Phase::ALL {
            assert!(session.pending(phase).is_empty());
        }
    }

    #[test]
    fn test_multiple_bad_commits() {
        let log = CallLog::new();
        let mut session = session();

        for label in ["data1", "data2"] {
            session.add(entity(label, &log)).unwrap();
            session.engine_mut().fail_next_commit("connection reset");
            assert!(session.commit().is_err());
            session.rollback().unwrap();
        }

        for label in ["data1", "data2"] {
            assert_hooks!(log, label => [
                "before_commit_from_insert",
                "failed_commit_from_insert",
            ]);
        }
    }

    #[test]
    fn test_success_drops_failed_bucket() {
        let log = CallLog::new();
        let mut session = session();

        session.add(entity("data", &log)).unwrap();
        session.commit().unwrap();

        // a later rollback has nothing to report for the committed entity
        session.add(entity("next", &log)).unwrap();
        session.flush().unwrap();
        session.rollback().unwrap();

        assert_eq!(log.count("data", slot(Phase::Failed, MutationKind::Insert)), 0);
        assert!(phase_calls(&log, Phase::Failed).is_empty());
    }

    #[test]
    fn test_rollback_without_commit_fires_nothing() {
        let log = CallLog::new();
        let mut session = session();

        session.add(entity("data", &log)).unwrap();
        session.flush().unwrap();
        session.rollback().unwrap();

        assert!(log.is_empty());
        assert_eq!(session.state(), LifecycleState::Idle);
        assert!(!session.is_locked());
    }

    #[test]
    fn test_full_rollback_forgets_flushed_entities() {
        let log = CallLog::new();
        let mut session = session();
        let ghost = entity("ghost", &log);

        session.add(ghost.clone()).unwrap();
        session.flush().unwrap();
        session.rollback().unwrap();
        for phase in Phase::ALL {
            assert!(session.pending(phase).is_empty());
        }

        session.add(entity("real", &log)).unwrap();
        session.commit().unwrap();

        assert_hooks!(log, "ghost" => []);
        assert_hooks!(log, "real" => [
            "before_commit_from_insert",
            "after_commit_from_insert",
        ]);
        assert!(!session.engine().is_committed(&ghost));
    }

    #[test]
    fn test_rollback_error_returned_after_failed_hooks() {
        let log = CallLog::new();
        let mut session = session();
        session.add(entity("data", &log)).unwrap();
        session.engine_mut().fail_next_commit("disk full");
        assert!(session.commit().is_err());

        session.engine_mut().fail_next_rollback("connection lost");
        let err = session.rollback().unwrap_err();

        assert!(err.to_string().contains("connection lost"));
        assert_hooks!(log, "data" => [
            "before_commit_from_insert",
            "failed_commit_from_insert",
        ]);
        assert!(!session.needs_rollback());
    }

    #[test]
    fn test_failed_hook_error_wins_over_rollback_error() {
        let log = CallLog::new();
        let mut session = session();
        let refusing = slot(Phase::Failed, MutationKind::Insert);
        session
            .add(Arc::new(RecordingEntity::new("data", &log).failing_on(refusing)))
            .unwrap();
        session.engine_mut().fail_next_commit("disk full");
        assert!(session.commit().is_err());

        session.engine_mut().fail_next_rollback("connection lost");
        let err = session.rollback().unwrap_err();

        assert_eq!(
            err.downcast_ref::<HookRefused>(),
            Some(&HookRefused {
                label: "data".to_string(),
                slot: refusing,
            })
        );
        assert_eq!(session.state(), LifecycleState::Idle);
        assert!(!session.is_locked());
        assert!(!session.needs_rollback());
    }

    #[test]
    fn test_pending_rollback_blocks_commit() {
        let log = CallLog::new();
        let mut session = session();
        session.add(entity("data", &log)).unwrap();
        session.engine_mut().fail_next_commit("disk full");
        assert!(session.commit().is_err());

        let err = session.commit().unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::PendingRollback { session: id }) if *id == session.id()
        ));
        assert_eq!(log.len(), 1);
    }

    // ==========================================================================
    // Savepoints
    // ==========================================================================

    #[test]
    fn test_nested_bad_flush() {
        let log = CallLog::new();
        let mut session = session();
        let outer = entity("outer", &log);
        let bad = entity("bad", &log);

        session.engine_mut().insert_with_key(1, outer.clone()).unwrap();
        session.begin_nested().unwrap();
        session.engine_mut().insert_with_key(1, bad.clone()).unwrap();

        let err = session.commit().unwrap_err();
        assert_eq!(err.downcast_ref::<DuplicateKey>(), Some(&DuplicateKey { key: 1 }));

        session.rollback().unwrap();
        assert!(log.is_empty());
        assert!(!session.engine().in_nested());

        session.commit().unwrap();

        assert_hooks!(log, "outer" => [
            "before_commit_from_insert",
            "after_commit_from_insert",
        ]);
        assert_hooks!(log, "bad" => []);
        assert!(session.engine().is_committed(&outer));
        assert!(!session.engine().is_committed(&bad));
    }

    #[test]
    fn test_released_savepoint_commits_with_outer() {
        let log = CallLog::new();
        let mut session = session();

        session.add(entity("outer", &log)).unwrap();
        session.begin_nested().unwrap();
        session.add(entity("inner", &log)).unwrap();
        session.commit().unwrap();
        assert!(log.is_empty());

        session.commit().unwrap();

        assert_eq!(
            phase_calls(&log, Phase::After),
            vec![
                ("outer".to_string(), MutationKind::Insert),
                ("inner".to_string(), MutationKind::Insert),
            ]
        );
    }

    // ==========================================================================
    // Re-entrant Hooks
    // ==========================================================================

    #[test]
    fn test_mutations_from_hooks_are_not_tracked() {
        let log = CallLog::new();
        let mut session = session();
        let children: Arc<Mutex<Vec<EntityRef>>> = Arc::default();

        let parent = {
            let log = log.clone();
            let children = children.clone();
            RecordingEntity::new("parent", &log).with_probe(move |ctx| {
                if ctx.phase() != Phase::Before {
                    return Ok(());
                }
                let child = EntityRef::from(Arc::new(RecordingEntity::new("child", &log)));
                let txn = transaction(ctx)?;
                txn.insert(child.clone())?;
                txn.flush()?;
                children.lock().unwrap().push(child);
                Ok(())
            })
        };

        session.add(Arc::new(parent)).unwrap();
        session.commit().unwrap();
        session.commit().unwrap();

        let children = children.lock().unwrap();
        assert_eq!(children.len(), 1);
        assert!(session.engine().is_committed(&children[0]));
        assert_hooks!(log, "child" => []);
        assert_hooks!(log, "parent" => [
            "before_commit_from_insert",
            "after_commit_from_insert",
        ]);
    }

    #[test]
    fn test_hooks_can_query_in_every_phase() {
        let log = CallLog::new();
        let mut session = session();
        let seen: Arc<Mutex<Vec<(HookSlot, usize)>>> = Arc::default();

        let data = {
            let seen = seen.clone();
            EntityRef::from(Arc::new(RecordingEntity::new("data", &log).with_probe(
                move |ctx| {
                    let slot = ctx.slot();
                    let rows = transaction(ctx)?.count()?;
                    seen.lock().unwrap().push((slot, rows));
                    Ok(())
                },
            )))
        };

        session.add(data.clone()).unwrap();
        session.commit().unwrap();
        session.delete(data).unwrap();
        session.commit().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (slot(Phase::Before, MutationKind::Insert), 1),
                (slot(Phase::After, MutationKind::Insert), 1),
                (slot(Phase::Before, MutationKind::Delete), 0),
                (slot(Phase::After, MutationKind::Delete), 0),
            ]
        );
    }

    #[test]
    fn test_after_hooks_see_scratch_transaction() {
        let log = CallLog::new();
        let mut session = session();
        let ids: Arc<Mutex<Vec<(Phase, u64)>>> = Arc::default();

        let data = {
            let ids = ids.clone();
            RecordingEntity::new("data", &log).with_probe(move |ctx| {
                let phase = ctx.phase();
                let id = transaction(ctx)?.id();
                ids.lock().unwrap().push((phase, id));
                Ok(())
            })
        };

        session.add(Arc::new(data)).unwrap();
        let live = session.query().id();
        session.commit().unwrap();

        let ids = ids.lock().unwrap();
        assert_eq!(ids[0], (Phase::Before, live));
        assert_eq!(ids[1].0, Phase::After);
        assert_ne!(ids[1].1, live);

        // the concluded transaction is back in place and refuses queries
        assert_eq!(session.query().id(), live);
        assert!(!session.query().is_active());
    }

    #[test]
    fn test_unscoped_after_hooks_hit_closed_transaction() {
        let log = CallLog::new();
        let mut session = memory_session(HooksConfig::default().with_scoped_queries(false));
        let data = EntityRef::from(Arc::new(RecordingEntity::new("data", &log).with_probe(
            |ctx| {
                transaction(ctx)?.count()?;
                Ok(())
            },
        )));

        session.add(data.clone()).unwrap();
        let err = session.commit().unwrap_err();

        assert!(err.to_string().contains("closed"));
        // committed regardless, and the cycle is over
        assert!(session.engine().is_committed(&data));
        assert!(!session.needs_rollback());
        assert!(!session.is_locked());
        assert!(session.pending(Phase::After).is_empty());
    }

    #[test]
    fn test_unflushed_changes_missed_without_flush_before_commit() {
        let log = CallLog::new();
        let mut session = memory_session(HooksConfig::default().with_flush_before_commit(false));
        let data = entity("data", &log);

        session.add(data.clone()).unwrap();
        session.commit().unwrap();

        // written by the physical commit while the tracker was locked
        assert!(session.engine().is_committed(&data));
        assert!(log.is_empty());
    }

    // ==========================================================================
    // Hook Failures
    // ==========================================================================

    #[test]
    fn test_before_hook_error_propagates_unchanged() {
        let log = CallLog::new();
        let mut session = session();
        let refusing = slot(Phase::Before, MutationKind::Update);

        let a = entity("a", &log);
        let b = EntityRef::from(Arc::new(
            RecordingEntity::new("b", &log).failing_on(refusing),
        ));
        let c = entity("c", &log);
        session.add(b.clone()).unwrap();
        session.add(c.clone()).unwrap();
        session.commit().unwrap();
        log.clear();

        session.delete(c.clone()).unwrap();
        session.update(b.clone()).unwrap();
        session.add(a.clone()).unwrap();
        let err = session.commit().unwrap_err();

        assert_eq!(
            err.downcast_ref::<HookRefused>(),
            Some(&HookRefused {
                label: "b".to_string(),
                slot: refusing,
            })
        );
        assert_eq!(
            session.pending(Phase::Before),
            vec![(b, MutationKind::Update), (c, MutationKind::Delete)]
        );
        assert_eq!(session.state(), LifecycleState::DispatchingBefore);
        assert!(session.needs_rollback());
        assert!(!session.engine().is_committed(&a));

        session.rollback().unwrap();

        assert_eq!(
            phase_calls(&log, Phase::Failed),
            vec![
                ("a".to_string(), MutationKind::Insert),
                ("b".to_string(), MutationKind::Update),
                ("c".to_string(), MutationKind::Delete),
            ]
        );
        assert!(phase_calls(&log, Phase::After).is_empty());
        assert!(!session.is_locked());
        for phase in Phase::ALL {
            assert!(session.pending(phase).is_empty());
        }
    }

    #[test]
    fn test_after_hook_error_ends_cycle() {
        let log = CallLog::new();
        let mut session = session();
        let first = EntityRef::from(Arc::new(
            RecordingEntity::new("first", &log)
                .failing_on(slot(Phase::After, MutationKind::Insert)),
        ));

        session.add(first.clone()).unwrap();
        session.add(entity("second", &log)).unwrap();
        let err = session.commit().unwrap_err();
        assert!(err.downcast_ref::<HookRefused>().is_some());

        // the failing hook stopped the pass; nothing carries into the next cycle
        assert_eq!(log.count("second", slot(Phase::After, MutationKind::Insert)), 0);
        assert!(session.engine().is_committed(&first));
        assert!(!session.is_locked());

        session.add(entity("third", &log)).unwrap();
        session.commit().unwrap();
        assert_hooks!(log, "second" => ["before_commit_from_insert"]);
        assert_hooks!(log, "third" => [
            "before_commit_from_insert",
            "after_commit_from_insert",
        ]);
    }

    #[test]
    fn test_scratch_transaction_is_discarded() {
        let log = CallLog::new();
        let mut session = session();
        let leaked: Arc<Mutex<Option<EntityRef>>> = Arc::default();

        let data = {
            let leaked = leaked.clone();
            let log = log.clone();
            RecordingEntity::new("data", &log).with_probe(move |ctx| {
                if ctx.phase() != Phase::After {
                    return Ok(());
                }
                let stray = EntityRef::from(Arc::new(RecordingEntity::new("stray", &log)));
                let txn = transaction(ctx)?;
                txn.insert(stray.clone())?;
                txn.flush()?;
                *leaked.lock().unwrap() = Some(stray);
                Ok(())
            })
        };

        session.add(Arc::new(data)).unwrap();
        session.commit().unwrap();
        session.commit().unwrap();

        let stray = leaked.lock().unwrap().clone().unwrap();
        assert!(!session.engine().is_committed(&stray));
        assert_hooks!(log, "stray" => []);
    }

    // ==========================================================================
    // Process-wide Listener
    // ==========================================================================

    #[test]
    fn test_engine_and_session_from_separate_global_listeners() {
        init_tracing();
        let _ = HookRegistry::global().try_register::<RecordingEntity>(HookSet::all());
        let log = CallLog::new();

        let engine = MemoryEngine::new(MutationListener::global());
        let mut session = HookedSession::new(engine, MutationListener::global());
        session.add(entity("data", &log)).unwrap();
        session.commit().unwrap();

        assert_hooks!(log, "data" => [
            "before_commit_from_insert",
            "after_commit_from_insert",
        ]);
    }

    #[test]
    fn test_query_handle_reports_activity() {
        let mut session = session();
        assert!(session.query().is_active());
        session.commit().unwrap();
        assert!(!QueryHandle::is_active(session.query()));
        assert!(!session.engine_mut().in_nested());
    }
}

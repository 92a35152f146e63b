//! Integration tests for vmexpired
//!
//! These tests drive the full expiration stack (store, executor, dispatcher,
//! engine, worker pool) with mock adapters, once per dispatch mode.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use vmexpire_adapter_api::{AdapterError, MockDeleter, MockNotifier};
use vmexpire_api::{NotificationKind, RejectionReason, SweepSummary, Task, VmRecord, VmStatus};
use vmexpire_config::{DispatchMode, ExpirationPolicy, SchedulerConfig};
use vmexpire_core::{
    CoreError, EventSink, ExpirationEngine, InlineDispatcher, ManualClock, QueuedDispatcher,
    TaskDispatcher, TaskExecutor, WorkerPool,
};
use vmexpire_store::{SqliteStore, Store, TaskQueue};
use vmexpire_util::{ProjectId, VmId};

const MODES: [DispatchMode; 2] = [DispatchMode::Inline, DispatchMode::Queued];

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn day(n: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::days(n)
}

/// Everything the daemon wires up, minus the control socket
struct Stack {
    mode: DispatchMode,
    store: Arc<SqliteStore>,
    notifier: MockNotifier,
    deleter: MockDeleter,
    clock: Arc<ManualClock>,
    executor: Arc<TaskExecutor>,
    engine: Arc<ExpirationEngine>,
    wake: Option<Arc<tokio::sync::Notify>>,
}

impl Stack {
    fn new(mode: DispatchMode) -> Self {
        Self::with_policy(mode, ExpirationPolicy::default())
    }

    fn with_policy(mode: DispatchMode, policy: ExpirationPolicy) -> Self {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let notifier = MockNotifier::new();
        let deleter = MockDeleter::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let events = EventSink::default();

        let executor = Arc::new(TaskExecutor::new(
            policy.clone(),
            store.clone(),
            Arc::new(notifier.clone()),
            Arc::new(deleter.clone()),
            Duration::from_millis(500),
            clock.clone(),
            events.clone(),
        ));

        let (dispatcher, wake): (Arc<dyn TaskDispatcher>, _) = match mode {
            DispatchMode::Inline => {
                let dispatcher: Arc<dyn TaskDispatcher> =
                    Arc::new(InlineDispatcher::new(executor.clone()));
                (dispatcher, None)
            }
            DispatchMode::Queued => {
                let queued = QueuedDispatcher::new(store.clone(), events.clone());
                let wake = queued.wake_handle();
                let dispatcher: Arc<dyn TaskDispatcher> = Arc::new(queued);
                (dispatcher, Some(wake))
            }
        };

        let engine = Arc::new(ExpirationEngine::new(
            policy,
            &SchedulerConfig::default(),
            store.clone(),
            dispatcher,
            events,
        ));

        Self {
            mode,
            store,
            notifier,
            deleter,
            clock,
            executor,
            engine,
            wake,
        }
    }

    async fn create(&self, id: &str, project: &str) -> VmId {
        let vm_id = VmId::new(id);
        self.engine
            .dispatcher()
            .submit(Task::RegisterCreated {
                vm_id: vm_id.clone(),
                project_id: ProjectId::new(project),
                created_at: t0(),
            })
            .await
            .unwrap();
        self.settle().await;
        vm_id
    }

    /// Sweep at `at` without waiting for queued work
    async fn sweep(&self, at: DateTime<Utc>) -> SweepSummary {
        self.clock.set(at);
        self.engine.run_once(at).await.summary
    }

    /// Sweep and let every dispatched task finish
    async fn tick(&self, at: DateTime<Utc>) -> SweepSummary {
        let summary = self.sweep(at).await;
        self.settle().await;
        summary
    }

    /// Run a worker pool until the queue is empty. Inline mode has nothing to wait for.
    async fn settle(&self) {
        let Some(wake) = &self.wake else {
            return;
        };

        let pool = WorkerPool::start(
            2,
            self.store.clone(),
            self.executor.clone(),
            wake.clone(),
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        for _ in 0..500 {
            if self.store.pending_count().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown().await;
    }

    fn record(&self, vm_id: &VmId) -> VmRecord {
        self.store.get_vm(vm_id).unwrap().unwrap()
    }

    fn warnings_sent(&self, vm_id: &VmId) -> usize {
        self.notifier
            .sent()
            .iter()
            .filter(|n| &n.vm_id == vm_id && n.kind == NotificationKind::ExpirationWarning)
            .count()
    }

    fn pending_deletes(&self, vm_id: &VmId) -> usize {
        self.store
            .list_pending()
            .unwrap()
            .iter()
            .filter(|q| matches!(&q.task, Task::DeleteVm { vm_id: id } if id == vm_id))
            .count()
    }
}

fn assert_record_invariants(record: &VmRecord, policy: &ExpirationPolicy) {
    assert!(record.expires_at > record.created_at, "{:?}", record);
    if let Some(notified_at) = record.notified_at {
        assert!(notified_at <= record.expires_at, "{:?}", record);
    }
    assert!(record.extended_days <= policy.max_extend_days, "{:?}", record);
}

#[tokio::test]
async fn full_lifecycle_timeline() {
    for mode in MODES {
        let stack = Stack::new(mode);
        let policy = ExpirationPolicy::default();
        let vm_id = stack.create("vm-1", "proj").await;
        assert_eq!(stack.record(&vm_id).expires_at, day(60));

        // Nothing before the notice window opens
        let summary = stack.tick(day(49)).await;
        assert_eq!(summary.transitions(), 0, "{:?}", mode);
        assert_eq!(stack.record(&vm_id).status, VmStatus::Active);

        // Notified at T+50d, exactly once
        let summary = stack.tick(day(50)).await;
        assert_eq!(summary.notified, 1, "{:?}", mode);
        for d in 51..60 {
            stack.tick(day(d)).await;
        }
        let record = stack.record(&vm_id);
        assert_eq!(record.status, VmStatus::Notified);
        assert_eq!(record.notified_at, Some(day(50)));
        assert_eq!(stack.warnings_sent(&vm_id), 1, "{:?}", mode);
        assert_record_invariants(&record, &policy);

        // Expired at T+60d
        let summary = stack.tick(day(60)).await;
        assert_eq!(summary.expired, 1);
        assert_eq!(stack.record(&vm_id).status, VmStatus::Expired);
        assert!(stack.deleter.deleted().is_empty());

        // Deletion goes out on the next tick
        let summary = stack.sweep(day(60) + ChronoDuration::minutes(1)).await;
        assert_eq!(summary.deletions_dispatched, 1, "{:?}", mode);
        match stack.mode {
            DispatchMode::Inline => assert_eq!(stack.record(&vm_id).status, VmStatus::Deleted),
            DispatchMode::Queued => {
                assert_eq!(stack.record(&vm_id).status, VmStatus::Deleting);
                stack.settle().await;
            }
        }

        let record = stack.record(&vm_id);
        assert_eq!(record.status, VmStatus::Deleted);
        assert_record_invariants(&record, &policy);
        assert_eq!(stack.deleter.deleted(), vec![vm_id.clone()]);

        let kinds: Vec<_> = stack.notifier.sent().iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![NotificationKind::ExpirationWarning, NotificationKind::Deleted]
        );

        // Terminal: later sweeps never see it again
        assert_eq!(stack.tick(day(400)).await.due, 0);
    }
}

#[tokio::test]
async fn sweep_without_time_advance_is_a_no_op() {
    for mode in MODES {
        let stack = Stack::new(mode);
        for i in 0..5 {
            stack.create(&format!("vm-{}", i), "proj").await;
        }

        let first = stack.sweep(day(50)).await;
        assert_eq!(first.notified, 5, "{:?}", mode);
        let pending_after_first = stack.store.pending_count().unwrap();
        let records_after_first = stack.engine.list_vms(Default::default()).unwrap();

        let second = stack.sweep(day(50)).await;
        assert_eq!(second.transitions(), 0, "{:?}", mode);
        assert_eq!(stack.store.pending_count().unwrap(), pending_after_first);
        assert_eq!(
            stack.engine.list_vms(Default::default()).unwrap(),
            records_after_first
        );
        stack.settle().await;

        // Expiry, then the delete step, each repeated at the same instant
        for at in [day(60), day(60) + ChronoDuration::minutes(1)] {
            let first = stack.sweep(at).await;
            assert_eq!(first.transitions(), 5, "{:?} at {}", mode, at);
            let pending_after_first = stack.store.pending_count().unwrap();
            let records_after_first = stack.engine.list_vms(Default::default()).unwrap();

            let second = stack.sweep(at).await;
            assert_eq!(second.transitions(), 0, "{:?} at {}", mode, at);
            assert_eq!(stack.store.pending_count().unwrap(), pending_after_first);
            assert_eq!(
                stack.engine.list_vms(Default::default()).unwrap(),
                records_after_first
            );
        }

        stack.settle().await;
        assert_eq!(stack.deleter.call_count(), 5, "{:?}", mode);
    }
}

#[tokio::test]
async fn repeated_sweep_after_late_first_sighting_is_a_no_op() {
    for mode in MODES {
        let stack = Stack::new(mode);
        let vm_id = stack.create("vm-1", "proj").await;

        let first = stack.sweep(day(70)).await;
        assert_eq!(first.notified, 1, "{:?}", mode);
        let record_after_first = stack.record(&vm_id);

        let second = stack.sweep(day(70)).await;
        assert_eq!(second.transitions(), 0, "{:?}", mode);
        assert_eq!(stack.record(&vm_id), record_after_first);
    }
}

#[tokio::test]
async fn extension_ceiling_holds_across_requests() {
    for mode in MODES {
        let stack = Stack::new(mode);
        let policy = ExpirationPolicy::default();
        let vm_id = stack.create("vm-1", "proj").await;
        stack.tick(day(50)).await;

        let record = stack.engine.request_extension(&vm_id, 20, day(51)).await.unwrap();
        assert_eq!(record.expires_at, day(80));
        assert_eq!(record.extend_count, 1);
        assert_eq!(record.status, VmStatus::Active);
        assert_eq!(record.notified_at, None);
        assert_record_invariants(&record, &policy);

        let err = stack
            .engine
            .request_extension(&vm_id, 15, day(51))
            .await
            .unwrap_err();
        match err {
            CoreError::PolicyViolation(RejectionReason::CeilingExceeded {
                requested_days,
                granted_days,
                ceiling_days,
            }) => {
                assert_eq!((requested_days, granted_days, ceiling_days), (15, 20, 30));
            }
            other => panic!("unexpected error {:?}", other),
        }

        // Exactly up to the ceiling is fine, one more day is not
        let record = stack.engine.request_extension(&vm_id, 10, day(52)).await.unwrap();
        assert_eq!(record.extended_days, 30);
        assert_eq!(record.extend_count, 2);
        assert!(stack.engine.request_extension(&vm_id, 1, day(52)).await.is_err());
        assert_record_invariants(&stack.record(&vm_id), &policy);

        // The warning is owed again for the new deadline
        stack.settle().await;
        stack.tick(day(80)).await;
        assert_eq!(stack.record(&vm_id).status, VmStatus::Notified);
        assert_eq!(stack.warnings_sent(&vm_id), 2, "{:?}", mode);
    }
}

#[tokio::test]
async fn expired_vm_cannot_be_extended() {
    for mode in MODES {
        let stack = Stack::new(mode);
        let vm_id = stack.create("vm-1", "proj").await;
        stack.tick(day(50)).await;
        stack.tick(day(60)).await;

        let err = stack
            .engine
            .request_extension(&vm_id, 5, day(60))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::PolicyViolation(RejectionReason::InvalidState {
                status: VmStatus::Expired
            })
        ));
    }
}

#[tokio::test]
async fn never_two_outstanding_deletes() {
    let stack = Stack::new(DispatchMode::Queued);
    let vm_id = stack.create("vm-1", "proj").await;
    stack.tick(day(50)).await;
    stack.tick(day(60)).await;

    // Workers are stopped, so the delete task stays outstanding across sweeps
    for minutes in 1..10 {
        stack.sweep(day(60) + ChronoDuration::minutes(minutes)).await;
    }
    assert_eq!(stack.pending_deletes(&vm_id), 1);

    stack.settle().await;
    assert_eq!(stack.deleter.call_count(), 1);
    assert_eq!(stack.record(&vm_id).status, VmStatus::Deleted);

    let inline = Stack::new(DispatchMode::Inline);
    let vm_id = inline.create("vm-1", "proj").await;
    inline.tick(day(50)).await;
    inline.tick(day(60)).await;
    for minutes in 1..10 {
        inline.tick(day(60) + ChronoDuration::minutes(minutes)).await;
    }
    assert_eq!(inline.deleter.call_count(), 1);
}

#[tokio::test]
async fn retryable_delete_failure_is_retried_next_sweep() {
    for mode in MODES {
        let stack = Stack::new(mode);
        let vm_id = stack.create("vm-1", "proj").await;
        stack.tick(day(50)).await;
        stack.tick(day(60)).await;

        stack.deleter.set_failure(Some(AdapterError::Timeout));
        let summary = stack.tick(day(61)).await;
        if mode == DispatchMode::Inline {
            assert_eq!(summary.failures, 1);
        } else {
            assert_eq!(summary.deletions_dispatched, 1);
        }
        let record = stack.record(&vm_id);
        assert_eq!(record.status, VmStatus::Expired, "{:?}", mode);
        assert!(stack.deleter.deleted().is_empty());

        stack.deleter.set_failure(None);
        let summary = stack.tick(day(62)).await;
        assert_eq!(summary.due, 1, "{:?}", mode);
        assert_eq!(stack.record(&vm_id).status, VmStatus::Deleted, "{:?}", mode);
        assert_eq!(stack.deleter.call_count(), 2);
    }
}

#[tokio::test]
async fn vm_already_gone_counts_as_deleted() {
    for mode in MODES {
        let stack = Stack::new(mode);
        let vm_id = stack.create("vm-1", "proj").await;
        stack.deleter.mark_gone(vm_id.clone());
        stack.tick(day(50)).await;
        stack.tick(day(60)).await;
        stack.tick(day(61)).await;

        assert_eq!(stack.record(&vm_id).status, VmStatus::Deleted, "{:?}", mode);
    }
}

#[tokio::test]
async fn excluded_vm_is_never_transitioned() {
    for mode in MODES {
        let stack = Stack::new(mode);
        let vm_id = stack.create("vm-1", "proj").await;
        let before = stack.engine.exclude(&vm_id, t0()).unwrap();

        for d in [50, 60, 61, 365] {
            let summary = stack.tick(day(d)).await;
            assert_eq!(summary.transitions(), 0, "{:?}", mode);
        }

        let record = stack.record(&vm_id);
        assert_eq!(record.status, VmStatus::Active);
        assert_eq!(record.version, before.version);
        assert!(stack.notifier.sent().is_empty());
        assert_eq!(stack.deleter.call_count(), 0);

        let rejected = stack.engine.request_extension(&vm_id, 5, day(10)).await;
        assert!(matches!(
            rejected,
            Err(CoreError::PolicyViolation(RejectionReason::Excluded))
        ));

        // Back under policy, long past its deadline: warned first, deleted later
        stack.engine.include(&vm_id, day(365)).unwrap();
        assert_eq!(stack.tick(day(365)).await.notified, 1);
        assert_eq!(stack.record(&vm_id).status, VmStatus::Notified);
    }
}

#[tokio::test]
async fn configured_project_exclusion() {
    let mut policy = ExpirationPolicy::default();
    policy.excluded_projects.insert(ProjectId::new("infra"));

    for mode in MODES {
        let stack = Stack::with_policy(mode, policy.clone());
        let infra = stack.create("vm-infra", "infra").await;
        let other = stack.create("vm-other", "proj").await;

        assert!(stack.record(&infra).excluded);
        stack.tick(day(50)).await;
        stack.tick(day(60)).await;
        stack.tick(day(61)).await;

        assert_eq!(stack.record(&infra).status, VmStatus::Active, "{:?}", mode);
        assert_eq!(stack.record(&other).status, VmStatus::Deleted, "{:?}", mode);
    }
}

#[tokio::test]
async fn notification_disabled_expires_directly() {
    let policy = ExpirationPolicy {
        notify_before_days: 0,
        ..ExpirationPolicy::default()
    };

    for mode in MODES {
        let stack = Stack::with_policy(mode, policy.clone());
        let vm_id = stack.create("vm-1", "proj").await;

        assert_eq!(stack.tick(day(50)).await.due, 0);
        let summary = stack.tick(day(60)).await;
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.notified, 0);
        assert_eq!(stack.warnings_sent(&vm_id), 0);
    }
}

#[tokio::test]
async fn first_seen_past_deadline_is_notified_before_deletion() {
    for mode in MODES {
        let stack = Stack::new(mode);
        let vm_id = stack.create("vm-1", "proj").await;

        // Daemon was down for the whole notice window and past the deadline
        let summary = stack.tick(day(70)).await;
        assert_eq!(summary.notified, 1);
        assert_eq!(summary.expired, 0);
        let record = stack.record(&vm_id);
        assert_eq!(record.status, VmStatus::Notified);
        // The owner gets the full notice period from the late warning
        assert_eq!(record.expires_at, day(80));
        assert_record_invariants(&record, &ExpirationPolicy::default());

        assert_eq!(stack.tick(day(71)).await.transitions(), 0, "{:?}", mode);
        assert_eq!(stack.tick(day(79)).await.transitions(), 0, "{:?}", mode);
        assert_eq!(stack.tick(day(80)).await.expired, 1);
        assert_eq!(stack.tick(day(80) + ChronoDuration::minutes(1)).await.deletions_dispatched, 1);
        assert_eq!(stack.record(&vm_id).status, VmStatus::Deleted, "{:?}", mode);
    }
}

#[tokio::test]
async fn creation_is_idempotent() {
    for mode in MODES {
        let stack = Stack::new(mode);
        let vm_id = stack.create("vm-1", "proj").await;
        stack.tick(day(50)).await;

        // Redelivered creation event must not reset the record
        stack.create("vm-1", "proj").await;
        let record = stack.record(&vm_id);
        assert_eq!(record.status, VmStatus::Notified, "{:?}", mode);
        assert_eq!(stack.engine.list_vms(Default::default()).unwrap().len(), 1);
    }
}

#[tokio::test]
async fn extension_racing_expiry_has_one_winner() {
    for mode in MODES {
        let stack = Stack::new(mode);
        let vm_id = stack.create("vm-1", "proj").await;
        stack.tick(day(50)).await;
        stack.clock.set(day(60));

        let (extension, summary) = tokio::join!(
            stack.engine.request_extension(&vm_id, 10, day(60)),
            stack.engine.run_once(day(60)),
        );
        stack.settle().await;

        let record = stack.record(&vm_id);
        match extension {
            Ok(extended) => {
                assert_eq!(extended.expires_at, day(70));
                assert_eq!(record.expires_at, day(70));
                assert_eq!(summary.summary.expired, 0);
                // Ten days from a ten-day notice: the warning is owed again at once,
                // and the sweep sends it if it reads the record after the extension
                match record.status {
                    VmStatus::Notified => assert_eq!(record.notified_at, Some(day(60))),
                    VmStatus::Active => assert_eq!(record.notified_at, None),
                    other => panic!("unexpected status {:?}", other),
                }
            }
            Err(CoreError::PolicyViolation(RejectionReason::InvalidState { .. })) => {
                assert_eq!(record.status, VmStatus::Expired);
                assert_eq!(record.extended_days, 0);
            }
            Err(e) => panic!("unexpected error {:?}", e),
        }
        assert_record_invariants(&record, &ExpirationPolicy::default());
    }
}

#[tokio::test]
async fn queued_crash_recovery() {
    let stack = Stack::new(DispatchMode::Queued);
    let claimed = stack.create("vm-claimed", "proj").await;
    let lost = stack.create("vm-lost", "proj").await;
    stack.tick(day(50)).await;
    stack.tick(day(60)).await;
    stack.sweep(day(61)).await;
    assert_eq!(stack.record(&claimed).status, VmStatus::Deleting);
    assert_eq!(stack.record(&lost).status, VmStatus::Deleting);

    // Simulated crash: one task was claimed and never acked, the other vanished
    let mut lost_task = None;
    while let Some(queued) = stack.store.claim_next().unwrap() {
        if queued.task.vm_id() == &lost {
            lost_task = Some(queued.id);
        }
    }
    stack.store.ack(lost_task.unwrap()).unwrap();

    // Startup: requeue claims, then roll back deletions with no task left
    assert_eq!(stack.store.requeue_claimed().unwrap(), 1);
    let outstanding: HashSet<VmId> = stack
        .store
        .list_pending()
        .unwrap()
        .into_iter()
        .map(|q| q.task.vm_id().clone())
        .collect();
    let recovered = stack.engine.recover_interrupted(&outstanding, day(62)).unwrap();
    assert_eq!(recovered, 1);
    assert_eq!(stack.record(&lost).status, VmStatus::Expired);

    stack.settle().await;
    assert_eq!(stack.record(&claimed).status, VmStatus::Deleted);

    stack.tick(day(62) + ChronoDuration::minutes(1)).await;
    assert_eq!(stack.record(&lost).status, VmStatus::Deleted);
    assert_eq!(stack.deleter.call_count(), 2);
}

#[tokio::test]
async fn audit_log_records_transitions() {
    let stack = Stack::new(DispatchMode::Inline);
    stack.create("vm-1", "proj").await;
    stack.tick(day(50)).await;
    stack.tick(day(60)).await;
    stack.tick(day(61)).await;

    let audits = stack.store.get_recent_audits(50).unwrap();
    let transitions = audits
        .iter()
        .filter(|a| matches!(a.event, vmexpire_store::AuditEventType::StatusChanged { .. }))
        .count();
    // notified, expired, deleting, deleted
    assert_eq!(transitions, 4);
}

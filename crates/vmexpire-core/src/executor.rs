//! Executes dispatched tasks against the store and the adapters
//!
//! Shared by the inline dispatcher and the worker pool, so a task behaves the
//! same whichever way it was dispatched.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vmexpire_adapter_api::{AdapterError, AdapterResult, Deleter, Notice, Notifier};
use vmexpire_api::{NotificationKind, Task, VmRecord, VmStatus};
use vmexpire_config::ExpirationPolicy;
use vmexpire_store::{AuditEvent, AuditEventType, Store, StoreError};
use vmexpire_util::{ProjectId, VmId};

use crate::lifecycle;
use crate::{Clock, CoreError, CoreEvent, CoreResult, EventSink};

/// Attempts for a store write that keeps losing the version race
pub(crate) const MAX_CONFLICT_RETRIES: usize = 3;

/// Run an adapter call, turning an elapsed deadline into [`AdapterError::Timeout`]
pub async fn call_with_timeout<T, F>(timeout: Duration, call: F) -> AdapterResult<T>
where
    F: Future<Output = AdapterResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Timeout),
    }
}

pub struct TaskExecutor {
    policy: ExpirationPolicy,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    deleter: Arc<dyn Deleter>,
    call_timeout: Duration,
    clock: Arc<dyn Clock>,
    events: EventSink,
}

impl TaskExecutor {
    pub fn new(
        policy: ExpirationPolicy,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        deleter: Arc<dyn Deleter>,
        call_timeout: Duration,
        clock: Arc<dyn Clock>,
        events: EventSink,
    ) -> Self {
        Self {
            policy,
            store,
            notifier,
            deleter,
            call_timeout,
            clock,
            events,
        }
    }

    pub async fn execute(&self, task: Task) -> CoreResult<()> {
        debug!(task = task.kind(), vm_id = %task.vm_id(), "Executing task");

        match task {
            Task::NotifyOwner { vm_id, kind } => self.notify_owner(&vm_id, kind).await,
            Task::DeleteVm { vm_id } => self.delete_vm(&vm_id).await,
            Task::RegisterCreated {
                vm_id,
                project_id,
                created_at,
            } => self.register_created(vm_id, project_id, created_at),
        }
    }

    fn load(&self, vm_id: &VmId) -> CoreResult<VmRecord> {
        self.store
            .get_vm(vm_id)?
            .ok_or_else(|| CoreError::NotFound(vm_id.clone()))
    }

    fn audit(&self, event: AuditEventType) {
        let _ = self
            .store
            .append_audit(AuditEvent::at(self.clock.now(), event));
    }

    async fn notify_owner(&self, vm_id: &VmId, kind: NotificationKind) -> CoreResult<()> {
        let record = self.load(vm_id)?;
        self.send_notice(&record, kind).await
    }

    /// Best effort: a failure is audited and reported but changes no state
    async fn send_notice(&self, record: &VmRecord, kind: NotificationKind) -> CoreResult<()> {
        let notice = Notice {
            project_id: record.project_id.clone(),
            vm_id: record.vm_id.clone(),
            kind,
            expires_at: (kind != NotificationKind::Deleted).then_some(record.expires_at),
        };

        match call_with_timeout(self.call_timeout, self.notifier.send(&notice)).await {
            Ok(()) => {
                info!(vm_id = %record.vm_id, kind = %kind, "Owner notified");
                self.audit(AuditEventType::NotificationSent {
                    vm_id: record.vm_id.clone(),
                    kind,
                });
                Ok(())
            }
            Err(e) => {
                warn!(vm_id = %record.vm_id, kind = %kind, error = %e, "Owner notification failed");
                self.audit(AuditEventType::NotificationFailed {
                    vm_id: record.vm_id.clone(),
                    kind,
                    error: e.to_string(),
                });
                Err(CoreError::from_adapter(e))
            }
        }
    }

    async fn delete_vm(&self, vm_id: &VmId) -> CoreResult<()> {
        let record = self.load(vm_id)?;
        if record.status != VmStatus::Deleting {
            // Stale or duplicate task; whoever moved the record on owns it now
            debug!(vm_id = %vm_id, status = %record.status, "Skipping delete for record not in deleting");
            return Ok(());
        }

        match call_with_timeout(self.call_timeout, self.deleter.delete(vm_id)).await {
            Ok(()) | Err(AdapterError::VmNotFound) => {
                let deleted = self.transition(vm_id, VmStatus::Deleting, |rec, now| {
                    lifecycle::apply_deleted(rec, now)
                })?;
                info!(vm_id = %vm_id, "VM deleted");
                self.audit(AuditEventType::StatusChanged {
                    vm_id: vm_id.clone(),
                    from: VmStatus::Deleting,
                    to: VmStatus::Deleted,
                });
                self.events.emit(CoreEvent::VmDeleted {
                    vm_id: vm_id.clone(),
                });

                // The record is already terminal, the notice cannot change that
                let _ = self.send_notice(&deleted, NotificationKind::Deleted).await;
                Ok(())
            }
            Err(e) => {
                warn!(vm_id = %vm_id, error = %e, "Deletion failed, will retry on a later sweep");
                let policy = &self.policy;
                self.transition(vm_id, VmStatus::Deleting, |rec, now| {
                    lifecycle::apply_delete_failed(rec, policy, now)
                })?;
                self.audit(AuditEventType::DeletionFailed {
                    vm_id: vm_id.clone(),
                    error: e.to_string(),
                });
                self.audit(AuditEventType::StatusChanged {
                    vm_id: vm_id.clone(),
                    from: VmStatus::Deleting,
                    to: VmStatus::Expired,
                });
                self.events.emit(CoreEvent::DeletionFailed {
                    vm_id: vm_id.clone(),
                    error: e.to_string(),
                });
                Err(CoreError::from_adapter(e))
            }
        }
    }

    /// Apply `f` to a record expected in `from`, retrying lost version races
    fn transition(
        &self,
        vm_id: &VmId,
        from: VmStatus,
        f: impl Fn(&VmRecord, DateTime<Utc>) -> VmRecord,
    ) -> CoreResult<VmRecord> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let record = self.load(vm_id)?;
            if record.status != from {
                return Err(CoreError::PolicyViolation(
                    vmexpire_api::RejectionReason::InvalidState {
                        status: record.status,
                    },
                ));
            }
            let next = f(&record, self.clock.now());
            match self.store.update_vm(&next, record.version) {
                Ok(stored) => return Ok(stored),
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(CoreError::Conflict(vm_id.clone()))
    }

    /// Start tracking a created VM. Registering an id twice is a no-op.
    fn register_created(
        &self,
        vm_id: VmId,
        project_id: ProjectId,
        created_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        if self.store.get_vm(&vm_id)?.is_some() {
            debug!(vm_id = %vm_id, "VM already tracked");
            return Ok(());
        }

        let record =
            lifecycle::new_record(vm_id, project_id, created_at, &self.policy, self.clock.now())?;

        match self.store.insert_vm(&record) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                debug!(vm_id = %record.vm_id, "VM registered concurrently");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            vm_id = %record.vm_id,
            project_id = %record.project_id,
            expires_at = %record.expires_at,
            excluded = record.excluded,
            "VM registered"
        );
        self.audit(AuditEventType::VmRegistered {
            vm_id: record.vm_id.clone(),
            project_id: record.project_id.clone(),
            expires_at: record.expires_at,
            excluded: record.excluded,
        });
        self.events.emit(CoreEvent::VmRegistered {
            vm_id: record.vm_id,
            project_id: record.project_id,
            expires_at: record.expires_at,
            excluded: record.excluded,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use vmexpire_adapter_api::{MockDeleter, MockNotifier};
    use vmexpire_store::SqliteStore;

    struct Harness {
        store: Arc<SqliteStore>,
        notifier: MockNotifier,
        deleter: MockDeleter,
        clock: Arc<ManualClock>,
        executor: TaskExecutor,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let notifier = MockNotifier::new();
        let deleter = MockDeleter::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let executor = TaskExecutor::new(
            ExpirationPolicy::default(),
            store.clone(),
            Arc::new(notifier.clone()),
            Arc::new(deleter.clone()),
            Duration::from_millis(200),
            clock.clone(),
            EventSink::default(),
        );
        Harness {
            store,
            notifier,
            deleter,
            clock,
            executor,
        }
    }

    fn register(h: &Harness, id: &str) -> VmId {
        let vm_id = VmId::new(id);
        h.executor
            .register_created(vm_id.clone(), ProjectId::new("proj"), t0())
            .unwrap();
        vm_id
    }

    fn force_status(h: &Harness, vm_id: &VmId, status: VmStatus) {
        let mut rec = h.store.get_vm(vm_id).unwrap().unwrap();
        let version = rec.version;
        rec.status = status;
        rec.due_at = None;
        h.store.update_vm(&rec, version).unwrap();
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let h = harness();
        let vm_id = register(&h, "vm-1");
        let first = h.store.get_vm(&vm_id).unwrap().unwrap();

        h.clock.advance(ChronoDuration::days(1));
        h.executor
            .execute(Task::RegisterCreated {
                vm_id: vm_id.clone(),
                project_id: ProjectId::new("other"),
                created_at: t0() + ChronoDuration::days(1),
            })
            .await
            .unwrap();

        assert_eq!(h.store.get_vm(&vm_id).unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn out_of_range_creation_time_is_rejected() {
        let h = harness();
        let vm_id = VmId::new("vm-far");

        let err = h
            .executor
            .execute(Task::RegisterCreated {
                vm_id: vm_id.clone(),
                project_id: ProjectId::new("proj"),
                created_at: DateTime::<Utc>::MAX_UTC,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTimestamp { .. }));
        assert!(!err.is_requeueable());
        assert!(h.store.get_vm(&vm_id).unwrap().is_none());

        // Later registrations are unaffected
        register(&h, "vm-1");
    }

    #[tokio::test]
    async fn delete_success_marks_deleted_and_notifies() {
        let h = harness();
        let vm_id = register(&h, "vm-1");
        force_status(&h, &vm_id, VmStatus::Deleting);

        h.executor
            .execute(Task::DeleteVm { vm_id: vm_id.clone() })
            .await
            .unwrap();

        let rec = h.store.get_vm(&vm_id).unwrap().unwrap();
        assert_eq!(rec.status, VmStatus::Deleted);
        assert_eq!(h.deleter.deleted(), vec![vm_id.clone()]);
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::Deleted);
    }

    #[tokio::test]
    async fn already_gone_counts_as_deleted() {
        let h = harness();
        let vm_id = register(&h, "vm-1");
        force_status(&h, &vm_id, VmStatus::Deleting);
        h.deleter.mark_gone(vm_id.clone());

        h.executor
            .execute(Task::DeleteVm { vm_id: vm_id.clone() })
            .await
            .unwrap();

        assert_eq!(
            h.store.get_vm(&vm_id).unwrap().unwrap().status,
            VmStatus::Deleted
        );
    }

    #[tokio::test]
    async fn retryable_failure_rolls_back_to_expired() {
        let h = harness();
        let vm_id = register(&h, "vm-1");
        force_status(&h, &vm_id, VmStatus::Deleting);
        h.deleter
            .set_failure(Some(AdapterError::Unavailable("503".into())));

        let err = h
            .executor
            .execute(Task::DeleteVm { vm_id: vm_id.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::TransientExternalFailure(_)));

        let rec = h.store.get_vm(&vm_id).unwrap().unwrap();
        assert_eq!(rec.status, VmStatus::Expired);
        assert_eq!(rec.due_at, Some(t0() + ChronoDuration::seconds(1)));
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn slow_deleter_times_out() {
        let h = harness();
        let vm_id = register(&h, "vm-1");
        force_status(&h, &vm_id, VmStatus::Deleting);
        h.deleter.set_delay(Some(Duration::from_secs(5)));

        let err = h
            .executor
            .execute(Task::DeleteVm { vm_id: vm_id.clone() })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::TransientExternalFailure(AdapterError::Timeout)
        ));
        assert_eq!(
            h.store.get_vm(&vm_id).unwrap().unwrap().status,
            VmStatus::Expired
        );
    }

    #[tokio::test]
    async fn stale_delete_task_is_ignored() {
        let h = harness();
        let vm_id = register(&h, "vm-1");

        h.executor
            .execute(Task::DeleteVm { vm_id: vm_id.clone() })
            .await
            .unwrap();

        assert_eq!(h.deleter.call_count(), 0);
        assert_eq!(
            h.store.get_vm(&vm_id).unwrap().unwrap().status,
            VmStatus::Active
        );
    }

    #[tokio::test]
    async fn notify_failure_leaves_record_alone() {
        let h = harness();
        let vm_id = register(&h, "vm-1");
        let before = h.store.get_vm(&vm_id).unwrap().unwrap();
        h.notifier.set_fail(true);

        let result = h
            .executor
            .execute(Task::NotifyOwner {
                vm_id: vm_id.clone(),
                kind: NotificationKind::ExpirationWarning,
            })
            .await;
        assert!(result.is_err());
        assert_eq!(h.store.get_vm(&vm_id).unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn notify_unknown_vm_is_not_found() {
        let h = harness();
        let err = h
            .executor
            .execute(Task::NotifyOwner {
                vm_id: VmId::new("ghost"),
                kind: NotificationKind::ExpirationWarning,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}

//! Expiration engine
//!
//! Owns every expiration-policy decision: the periodic sweep, extension
//! requests and exclusion changes. Side effects leave through the dispatcher;
//! state changes go through compare-and-swap writes so a sweep and a user
//! request racing on the same record cannot both win.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use vmexpire_api::{NotificationKind, Page, SweepSummary, Task, VmRecord, VmStatus};
use vmexpire_config::{ExpirationPolicy, SchedulerConfig};
use vmexpire_store::{AuditEvent, AuditEventType, Store, StoreError};
use vmexpire_util::{ProjectId, VmId};

use crate::executor::MAX_CONFLICT_RETRIES;
use crate::lifecycle::{self, Transition};
use crate::{CoreError, CoreEvent, CoreResult, DispatchError, EventSink, TaskDispatcher};

/// Upper bound on DELETING records examined at startup
const RECOVERY_SCAN_LIMIT: usize = 10_000;

/// Result of one sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub summary: SweepSummary,
}

/// What happened to one record during a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Notified,
    Expired,
    DeletionDispatched,
    Skipped,
    Conflict,
    Failed,
}

pub struct ExpirationEngine {
    policy: ExpirationPolicy,
    batch_size: usize,
    sweep_concurrency: usize,
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn TaskDispatcher>,
    events: EventSink,
    /// DELETING records whose delete was never queued and whose rollback
    /// write failed; retried at the start of every sweep
    stranded: Mutex<HashSet<VmId>>,
}

impl ExpirationEngine {
    pub fn new(
        policy: ExpirationPolicy,
        scheduler: &SchedulerConfig,
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn TaskDispatcher>,
        events: EventSink,
    ) -> Self {
        info!(
            max_duration_days = policy.max_duration_days,
            max_extend_days = policy.max_extend_days,
            notify_before_days = policy.notify_before_days,
            excluded_projects = policy.excluded_projects.len(),
            "Expiration engine initialized"
        );

        Self {
            policy,
            batch_size: scheduler.batch_size.max(1),
            sweep_concurrency: scheduler.sweep_concurrency.max(1),
            store,
            dispatcher,
            events,
            stranded: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> &ExpirationPolicy {
        &self.policy
    }

    pub fn dispatcher(&self) -> &Arc<dyn TaskDispatcher> {
        &self.dispatcher
    }

    fn audit(&self, now: DateTime<Utc>, event: AuditEventType) {
        let _ = self.store.append_audit(AuditEvent::at(now, event));
    }

    fn audit_transition(&self, now: DateTime<Utc>, vm_id: &VmId, from: VmStatus, to: VmStatus) {
        self.audit(
            now,
            AuditEventType::StatusChanged {
                vm_id: vm_id.clone(),
                from,
                to,
            },
        );
    }

    // Queries

    pub fn get_vm(&self, vm_id: &VmId) -> CoreResult<VmRecord> {
        self.store
            .get_vm(vm_id)?
            .ok_or_else(|| CoreError::NotFound(vm_id.clone()))
    }

    pub fn list_vms(&self, page: Page) -> CoreResult<Vec<VmRecord>> {
        Ok(self.store.list_vms(page)?)
    }

    pub fn list_project_vms(&self, project_id: &ProjectId, page: Page) -> CoreResult<Vec<VmRecord>> {
        Ok(self.store.list_vms_by_project(project_id, page)?)
    }

    // Sweep

    /// Evaluate every due record once.
    ///
    /// Per-record failures are counted and logged; they never abort the sweep.
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut summary = SweepSummary {
            started_at: Some(now),
            ..Default::default()
        };
        self.roll_back_stranded(now);

        let due = match self.store.list_due(now, self.batch_size) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Failed to scan for due records");
                summary.failures += 1;
                self.events.emit(CoreEvent::SweepCompleted(summary.clone()));
                return SweepReport { summary };
            }
        };
        summary.due = due.len();

        let outcomes: Vec<RecordOutcome> = stream::iter(due)
            .map(|record| self.process_record(record, now))
            .buffer_unordered(self.sweep_concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                RecordOutcome::Notified => summary.notified += 1,
                RecordOutcome::Expired => summary.expired += 1,
                RecordOutcome::DeletionDispatched => summary.deletions_dispatched += 1,
                RecordOutcome::Skipped => summary.skipped += 1,
                RecordOutcome::Conflict => summary.conflicts += 1,
                RecordOutcome::Failed => summary.failures += 1,
            }
        }

        if summary.due > 0 {
            info!(
                due = summary.due,
                notified = summary.notified,
                expired = summary.expired,
                deletions = summary.deletions_dispatched,
                conflicts = summary.conflicts,
                failures = summary.failures,
                "Sweep completed"
            );
        } else {
            debug!("Sweep found nothing due");
        }

        self.events.emit(CoreEvent::SweepCompleted(summary.clone()));
        SweepReport { summary }
    }

    async fn process_record(&self, record: VmRecord, now: DateTime<Utc>) -> RecordOutcome {
        let vm_id = record.vm_id.clone();

        if !record.excluded && self.policy.is_project_excluded(&record.project_id) {
            return self.exclude_by_project(record, now);
        }

        let Some(transition) = lifecycle::next_transition(&record, &self.policy, now) else {
            return self.recompute_due(record, now);
        };

        let result = match transition {
            Transition::Notify => self.notify(record, now).await,
            Transition::Expire => self.expire(record, now),
            Transition::Delete => self.dispatch_delete(record, now).await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(CoreError::Conflict(_)) => {
                debug!(vm_id = %vm_id, "Record changed during sweep, retrying next tick");
                RecordOutcome::Conflict
            }
            Err(e) => {
                warn!(vm_id = %vm_id, error = %e, "Failed to process record");
                RecordOutcome::Failed
            }
        }
    }

    /// CAS write used by the sweep: a lost race is reported, never retried
    fn write(&self, next: &VmRecord, read_version: u64) -> CoreResult<VmRecord> {
        match self.store.update_vm(next, read_version) {
            Ok(stored) => Ok(stored),
            Err(StoreError::Conflict { .. }) => Err(CoreError::Conflict(next.vm_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    fn exclude_by_project(&self, record: VmRecord, now: DateTime<Utc>) -> RecordOutcome {
        let next = lifecycle::apply_exclusion(&record, &self.policy, true, now);
        match self.write(&next, record.version) {
            Ok(_) => {
                info!(vm_id = %record.vm_id, project_id = %record.project_id, "Excluded by project");
                self.audit(
                    now,
                    AuditEventType::ExclusionChanged {
                        vm_id: record.vm_id.clone(),
                        excluded: true,
                    },
                );
                self.events.emit(CoreEvent::ExclusionChanged {
                    vm_id: record.vm_id,
                    excluded: true,
                });
                RecordOutcome::Skipped
            }
            Err(CoreError::Conflict(_)) => RecordOutcome::Conflict,
            Err(e) => {
                warn!(vm_id = %record.vm_id, error = %e, "Failed to exclude record");
                RecordOutcome::Failed
            }
        }
    }

    /// Due record with nothing to do: its stored due time is stale
    fn recompute_due(&self, record: VmRecord, now: DateTime<Utc>) -> RecordOutcome {
        let due_at = lifecycle::due_at(&record, &self.policy);
        if due_at == record.due_at {
            return RecordOutcome::Skipped;
        }

        let next = lifecycle::apply_recompute(&record, &self.policy, now);
        match self.write(&next, record.version) {
            Ok(_) => {
                debug!(vm_id = %record.vm_id, due_at = ?next.due_at, "Due time recomputed");
                RecordOutcome::Skipped
            }
            Err(CoreError::Conflict(_)) => RecordOutcome::Conflict,
            Err(e) => {
                warn!(vm_id = %record.vm_id, error = %e, "Failed to recompute due time");
                RecordOutcome::Failed
            }
        }
    }

    async fn notify(&self, record: VmRecord, now: DateTime<Utc>) -> CoreResult<RecordOutcome> {
        let next = lifecycle::apply_notify(&record, &self.policy, now);
        let stored = self.write(&next, record.version)?;

        info!(vm_id = %stored.vm_id, expires_at = %stored.expires_at, "Expiration warning due");
        self.audit_transition(now, &stored.vm_id, record.status, stored.status);
        self.events.emit(CoreEvent::VmNotified {
            vm_id: stored.vm_id.clone(),
            expires_at: stored.expires_at,
        });

        let task = Task::NotifyOwner {
            vm_id: stored.vm_id.clone(),
            kind: NotificationKind::ExpirationWarning,
        };
        if let Err(e) = self.dispatcher.submit(task).await {
            // notified_at stays set; the warning is best effort
            warn!(vm_id = %stored.vm_id, error = %e, "Expiration warning not delivered");
        }

        Ok(RecordOutcome::Notified)
    }

    fn expire(&self, record: VmRecord, now: DateTime<Utc>) -> CoreResult<RecordOutcome> {
        let next = lifecycle::apply_expire(&record, &self.policy, now);
        let stored = self.write(&next, record.version)?;

        info!(vm_id = %stored.vm_id, "VM expired");
        self.audit_transition(now, &stored.vm_id, record.status, stored.status);
        self.events.emit(CoreEvent::VmExpired {
            vm_id: stored.vm_id,
        });
        Ok(RecordOutcome::Expired)
    }

    async fn dispatch_delete(
        &self,
        record: VmRecord,
        now: DateTime<Utc>,
    ) -> CoreResult<RecordOutcome> {
        let next = lifecycle::apply_delete_dispatched(&record, now);
        let stored = self.write(&next, record.version)?;
        let vm_id = stored.vm_id.clone();

        self.audit_transition(now, &vm_id, record.status, stored.status);
        self.events.emit(CoreEvent::DeletionDispatched {
            vm_id: vm_id.clone(),
        });

        match self
            .dispatcher
            .submit(Task::DeleteVm {
                vm_id: vm_id.clone(),
            })
            .await
        {
            Ok(()) => {
                info!(vm_id = %vm_id, "Deletion dispatched");
                Ok(RecordOutcome::DeletionDispatched)
            }
            Err(DispatchError::Unavailable(error)) => {
                // Nothing will run the task; undo so the next sweep tries again
                let rollback = lifecycle::apply_delete_failed(&stored, &self.policy, now);
                if let Err(e) = self.write(&rollback, stored.version) {
                    warn!(vm_id = %vm_id, error = %e, "Rollback after refused dispatch failed");
                    self.stranded.lock().unwrap().insert(vm_id);
                    return Ok(RecordOutcome::Failed);
                }
                self.audit(
                    now,
                    AuditEventType::DispatchFailed {
                        vm_id: vm_id.clone(),
                        error: error.clone(),
                    },
                );
                self.audit_transition(now, &vm_id, VmStatus::Deleting, VmStatus::Expired);
                self.events.emit(CoreEvent::DeletionFailed { vm_id, error });
                Ok(RecordOutcome::Failed)
            }
            Err(DispatchError::Execution(e)) => {
                // Inline run; the executor already put the record back
                debug!(vm_id = %vm_id, error = %e, "Inline deletion failed");
                Ok(RecordOutcome::Failed)
            }
        }
    }

    /// Retry rollbacks that failed in an earlier sweep
    fn roll_back_stranded(&self, now: DateTime<Utc>) {
        let stranded: Vec<VmId> = self.stranded.lock().unwrap().iter().cloned().collect();

        for vm_id in stranded {
            let result = self.get_vm(&vm_id).and_then(|record| {
                if record.status != VmStatus::Deleting {
                    return Ok(false);
                }
                let next = lifecycle::apply_delete_failed(&record, &self.policy, now);
                self.write(&next, record.version).map(|_| true)
            });

            match result {
                Ok(rolled_back) => {
                    if rolled_back {
                        info!(vm_id = %vm_id, "Stranded deletion rolled back");
                        self.audit_transition(now, &vm_id, VmStatus::Deleting, VmStatus::Expired);
                    }
                    self.stranded.lock().unwrap().remove(&vm_id);
                }
                Err(CoreError::NotFound(_)) => {
                    self.stranded.lock().unwrap().remove(&vm_id);
                }
                Err(e) => {
                    warn!(vm_id = %vm_id, error = %e, "Stranded deletion still not rolled back");
                }
            }
        }
    }

    // User mutators

    /// Run `attempt` until it stops losing version races
    fn with_conflict_retry<T>(
        &self,
        vm_id: &VmId,
        mut attempt: impl FnMut() -> CoreResult<T>,
    ) -> CoreResult<T> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            match attempt() {
                Err(CoreError::Conflict(_)) => {
                    debug!(vm_id = %vm_id, "Concurrent update, retrying");
                    continue;
                }
                other => return other,
            }
        }
        Err(CoreError::Conflict(vm_id.clone()))
    }

    /// Grant `days` more lifetime, or explain why not
    pub async fn request_extension(
        &self,
        vm_id: &VmId,
        days: u32,
        now: DateTime<Utc>,
    ) -> CoreResult<VmRecord> {
        let stored = self.with_conflict_retry(vm_id, || {
            let record = self.get_vm(vm_id)?;

            let next = match lifecycle::apply_extension(&record, &self.policy, days, now) {
                Ok(next) => next,
                Err(reason) => {
                    info!(vm_id = %vm_id, days, reason = %reason, "Extension rejected");
                    self.audit(
                        now,
                        AuditEventType::ExtensionRejected {
                            vm_id: vm_id.clone(),
                            days,
                            reason: reason.to_string(),
                        },
                    );
                    return Err(CoreError::PolicyViolation(reason));
                }
            };
            let stored = self.write(&next, record.version)?;

            self.audit_transition(now, vm_id, record.status, VmStatus::Extended);
            self.audit_transition(now, vm_id, VmStatus::Extended, stored.status);
            Ok(stored)
        })?;

        info!(
            vm_id = %vm_id,
            days,
            expires_at = %stored.expires_at,
            extended_days = stored.extended_days,
            "Extension granted"
        );
        self.audit(
            now,
            AuditEventType::ExtensionGranted {
                vm_id: vm_id.clone(),
                days,
                new_expires_at: stored.expires_at,
            },
        );
        self.events.emit(CoreEvent::VmExtended {
            vm_id: vm_id.clone(),
            days,
            expires_at: stored.expires_at,
            extended_days: stored.extended_days,
        });

        let task = Task::NotifyOwner {
            vm_id: vm_id.clone(),
            kind: NotificationKind::ExtensionConfirmed,
        };
        if let Err(e) = self.dispatcher.submit(task).await {
            warn!(vm_id = %vm_id, error = %e, "Extension confirmation not delivered");
        }

        Ok(stored)
    }

    /// Stop expiring a VM. Excluding an excluded VM changes nothing.
    pub fn exclude(&self, vm_id: &VmId, now: DateTime<Utc>) -> CoreResult<VmRecord> {
        self.set_excluded(vm_id, true, now)
    }

    /// Resume expiring a VM
    pub fn include(&self, vm_id: &VmId, now: DateTime<Utc>) -> CoreResult<VmRecord> {
        self.set_excluded(vm_id, false, now)
    }

    fn set_excluded(&self, vm_id: &VmId, excluded: bool, now: DateTime<Utc>) -> CoreResult<VmRecord> {
        let (stored, changed) = self.with_conflict_retry(vm_id, || {
            let record = self.get_vm(vm_id)?;
            lifecycle::check_exclusion(&record).map_err(CoreError::PolicyViolation)?;

            if record.excluded == excluded {
                return Ok((record, false));
            }
            let next = lifecycle::apply_exclusion(&record, &self.policy, excluded, now);
            Ok((self.write(&next, record.version)?, true))
        })?;

        if changed {
            info!(vm_id = %vm_id, excluded, "Exclusion changed");
            self.audit(
                now,
                AuditEventType::ExclusionChanged {
                    vm_id: vm_id.clone(),
                    excluded,
                },
            );
            self.events.emit(CoreEvent::ExclusionChanged {
                vm_id: vm_id.clone(),
                excluded,
            });
        }

        Ok(stored)
    }

    // Recovery

    /// Roll back DELETING records whose delete task was lost.
    ///
    /// Run once at startup, before the scheduler. `outstanding` holds the VMs
    /// that still have a delete task waiting in the queue.
    pub fn recover_interrupted(
        &self,
        outstanding: &HashSet<VmId>,
        now: DateTime<Utc>,
    ) -> CoreResult<usize> {
        let mut recovered = 0;
        let deleting = self
            .store
            .list_by_status(VmStatus::Deleting, RECOVERY_SCAN_LIMIT)?;

        for record in deleting {
            if outstanding.contains(&record.vm_id) {
                continue;
            }
            let next = lifecycle::apply_delete_failed(&record, &self.policy, now);
            match self.write(&next, record.version) {
                Ok(_) => {
                    warn!(vm_id = %record.vm_id, "Recovered interrupted deletion");
                    self.audit_transition(now, &record.vm_id, VmStatus::Deleting, VmStatus::Expired);
                    recovered += 1;
                }
                Err(CoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(recovered)
    }
}

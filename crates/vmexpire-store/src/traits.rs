//! Store trait definitions

use chrono::{DateTime, Utc};
use vmexpire_api::{Page, Task, VmRecord, VmStatus};
use vmexpire_util::{ProjectId, TaskId, VmId};

use crate::{AuditEvent, StoreResult};

/// Main store trait
pub trait Store: Send + Sync {
    // VM records

    /// Insert a new record; `AlreadyExists` if the id is taken
    fn insert_vm(&self, record: &VmRecord) -> StoreResult<()>;

    fn get_vm(&self, vm_id: &VmId) -> StoreResult<Option<VmRecord>>;

    /// All records, oldest first
    fn list_vms(&self, page: Page) -> StoreResult<Vec<VmRecord>>;

    fn list_vms_by_project(&self, project_id: &ProjectId, page: Page)
        -> StoreResult<Vec<VmRecord>>;

    /// Non-excluded schedulable records with `due_at <= now`, earliest first
    fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<VmRecord>>;

    /// Records in one status, oldest update first
    fn list_by_status(&self, status: VmStatus, limit: usize) -> StoreResult<Vec<VmRecord>>;

    /// Compare-and-swap write.
    ///
    /// Succeeds only if the stored version equals `expected_version`; the
    /// version is bumped and the stored record returned.
    fn update_vm(&self, record: &VmRecord, expected_version: u64) -> StoreResult<VmRecord>;

    /// Purge a record; returns whether it existed
    fn delete_vm(&self, vm_id: &VmId) -> StoreResult<bool>;

    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}

/// Durable FIFO of pending tasks
///
/// A claimed task stays in the queue until it is acked, so a crash between
/// claim and ack redelivers it after `requeue_claimed`.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: &Task) -> StoreResult<TaskId>;

    /// Claim the oldest pending task
    fn claim_next(&self) -> StoreResult<Option<QueuedTask>>;

    /// Remove a finished task
    fn ack(&self, id: TaskId) -> StoreResult<()>;

    /// Hand a claimed task back to the pending set
    fn release(&self, id: TaskId) -> StoreResult<()>;

    /// Return every claimed task to pending; run at startup
    fn requeue_claimed(&self) -> StoreResult<usize>;

    /// Pending tasks, oldest first
    fn list_pending(&self) -> StoreResult<Vec<QueuedTask>>;

    fn pending_count(&self) -> StoreResult<u64>;
}

/// A task as held by the queue
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: TaskId,
    pub task: Task,
    /// Claims so far, including the current one
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

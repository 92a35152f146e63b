//! Audit event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmexpire_api::{NotificationKind, VmStatus};
use vmexpire_util::{ProjectId, VmId};

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    ServiceStarted,

    ServiceStopped,

    /// A created VM started being tracked
    VmRegistered {
        vm_id: VmId,
        project_id: ProjectId,
        expires_at: DateTime<Utc>,
        excluded: bool,
    },

    /// Lifecycle transition
    StatusChanged {
        vm_id: VmId,
        from: VmStatus,
        to: VmStatus,
    },

    ExtensionGranted {
        vm_id: VmId,
        days: u32,
        new_expires_at: DateTime<Utc>,
    },

    ExtensionRejected {
        vm_id: VmId,
        days: u32,
        reason: String,
    },

    NotificationSent {
        vm_id: VmId,
        kind: NotificationKind,
    },

    NotificationFailed {
        vm_id: VmId,
        kind: NotificationKind,
        error: String,
    },

    DeletionFailed { vm_id: VmId, error: String },

    ExclusionChanged { vm_id: VmId, excluded: bool },

    /// The dispatcher refused a task
    DispatchFailed { vm_id: VmId, error: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    pub timestamp: DateTime<Utc>,

    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self::at(vmexpire_util::now(), event)
    }

    /// Event stamped with an explicit time
    pub fn at(timestamp: DateTime<Utc>, event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp,
            event,
        }
    }
}

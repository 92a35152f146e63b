//! Event types for vmexpired -> client streaming

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmexpire_util::{ProjectId, VmId};

use crate::{SweepSummary, API_VERSION};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: vmexpire_util::now(),
            payload,
        }
    }
}

/// Lifecycle events streamed to subscribed clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A created VM is now tracked
    VmRegistered {
        vm_id: VmId,
        project_id: ProjectId,
        expires_at: DateTime<Utc>,
        excluded: bool,
    },

    /// Expiration warning queued for the owner
    VmNotified {
        vm_id: VmId,
        expires_at: DateTime<Utc>,
    },

    VmExtended {
        vm_id: VmId,
        days: u32,
        expires_at: DateTime<Utc>,
        extended_days: u32,
    },

    VmExpired { vm_id: VmId },

    /// Deletion handed to the dispatcher
    DeletionDispatched { vm_id: VmId },

    /// Deletion confirmed by the provider
    VmDeleted { vm_id: VmId },

    /// Deletion failed, retried on a later sweep
    DeletionFailed { vm_id: VmId, error: String },

    VmExcluded { vm_id: VmId },

    VmIncluded { vm_id: VmId },

    SweepCompleted(SweepSummary),

    /// The dispatcher refused work, tasks are not being delivered
    DispatcherUnhealthy { error: String },

    /// Daemon is shutting down
    Shutdown,
}

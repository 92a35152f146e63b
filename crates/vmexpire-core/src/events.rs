//! Core events emitted by the engine and the task executor

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use vmexpire_api::SweepSummary;
use vmexpire_util::{ProjectId, VmId};

/// Lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    VmRegistered {
        vm_id: VmId,
        project_id: ProjectId,
        expires_at: DateTime<Utc>,
        excluded: bool,
    },

    /// Expiration warning handed to the dispatcher
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

    VmExpired {
        vm_id: VmId,
    },

    DeletionDispatched {
        vm_id: VmId,
    },

    VmDeleted {
        vm_id: VmId,
    },

    /// Deletion failed, the record is back to EXPIRED
    DeletionFailed {
        vm_id: VmId,
        error: String,
    },

    ExclusionChanged {
        vm_id: VmId,
        excluded: bool,
    },

    SweepCompleted(SweepSummary),

    DispatcherUnhealthy {
        error: String,
    },
}

/// Fan-out point for [`CoreEvent`]s.
///
/// Emitting never blocks and never fails; events are dropped when nobody
/// listens or a listener lags behind.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}

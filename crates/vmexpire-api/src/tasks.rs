//! Units of work handed to the task dispatcher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmexpire_util::{ProjectId, VmId};

use crate::{NotificationKind, VmCreatedEvent};

/// A task as queued and executed by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    /// Send a lifecycle message to the VM's owner
    NotifyOwner {
        vm_id: VmId,
        kind: NotificationKind,
    },

    /// Delete the VM at the compute provider
    DeleteVm { vm_id: VmId },

    /// Start tracking a freshly created VM
    RegisterCreated {
        vm_id: VmId,
        project_id: ProjectId,
        created_at: DateTime<Utc>,
    },
}

impl Task {
    pub fn vm_id(&self) -> &VmId {
        match self {
            Task::NotifyOwner { vm_id, .. }
            | Task::DeleteVm { vm_id }
            | Task::RegisterCreated { vm_id, .. } => vm_id,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Task::NotifyOwner { .. } => "notify_owner",
            Task::DeleteVm { .. } => "delete_vm",
            Task::RegisterCreated { .. } => "register_created",
        }
    }
}

impl From<VmCreatedEvent> for Task {
    fn from(event: VmCreatedEvent) -> Self {
        Task::RegisterCreated {
            vm_id: event.vm_id,
            project_id: event.project_id,
            created_at: event.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_wire_format() {
        let task = Task::NotifyOwner {
            vm_id: VmId::new("vm-1"),
            kind: NotificationKind::ExpirationWarning,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "notify_owner");
        assert_eq!(json["vm_id"], "vm-1");
        assert_eq!(json["kind"], "expiration_warning");
    }

    #[test]
    fn created_event_becomes_register_task() {
        let created_at = Utc::now();
        let task: Task = VmCreatedEvent {
            vm_id: VmId::new("vm-2"),
            project_id: ProjectId::new("proj"),
            created_at,
        }
        .into();

        assert_eq!(task.kind(), "register_created");
        assert_eq!(task.vm_id(), &VmId::new("vm-2"));
    }
}

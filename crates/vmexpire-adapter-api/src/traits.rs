//! Adapter traits

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vmexpire_api::NotificationKind;
use vmexpire_util::{ProjectId, VmId};

/// Errors from adapter calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("Call timed out")]
    Timeout,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The provider does not know the VM; it is already gone
    #[error("VM not found at provider")]
    VmNotFound,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AdapterError {
    /// Worth trying again on a later sweep
    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }

    /// Retrying cannot change the outcome
    pub fn is_terminal(&self) -> bool {
        matches!(self, AdapterError::VmNotFound)
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// A lifecycle message addressed to a VM's owning project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub project_id: ProjectId,
    pub vm_id: VmId,
    pub kind: NotificationKind,
    /// Deadline at the time the notice was built, if still relevant
    pub expires_at: Option<DateTime<Utc>>,
}

impl Notice {
    pub fn subject(&self) -> String {
        match self.kind {
            NotificationKind::ExpirationWarning => format!("VM {} is about to expire", self.vm_id),
            NotificationKind::ExtensionConfirmed => format!("VM {} has been extended", self.vm_id),
            NotificationKind::Deleted => format!("VM {} has been deleted", self.vm_id),
        }
    }

    pub fn body(&self) -> String {
        let deadline = self
            .expires_at
            .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string());

        match (self.kind, deadline) {
            (NotificationKind::ExpirationWarning, Some(at)) => format!(
                "The VM {} of project {} will be deleted after {}. \
                 Request an extension if you still need it.",
                self.vm_id, self.project_id, at
            ),
            (NotificationKind::ExtensionConfirmed, Some(at)) => format!(
                "The VM {} of project {} now expires at {}.",
                self.vm_id, self.project_id, at
            ),
            (NotificationKind::Deleted, _) => format!(
                "The VM {} of project {} reached its maximum lifetime and was deleted.",
                self.vm_id, self.project_id
            ),
            (_, None) => format!("Lifecycle update for VM {}.", self.vm_id),
        }
    }
}

/// Delivers lifecycle messages to VM owners
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notice: &Notice) -> AdapterResult<()>;
}

/// Deletes VMs at the compute provider
#[async_trait]
pub trait Deleter: Send + Sync {
    async fn delete(&self, vm_id: &VmId) -> AdapterResult<()>;
}

//! Core error taxonomy

use chrono::{DateTime, Utc};
use thiserror::Error;
use vmexpire_adapter_api::AdapterError;
use vmexpire_api::RejectionReason;
use vmexpire_store::StoreError;
use vmexpire_util::VmId;

/// Errors from core operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("VM not found: {0}")]
    NotFound(VmId),

    #[error("Request rejected: {0}")]
    PolicyViolation(RejectionReason),

    /// Lost the optimistic-concurrency race on every attempt
    #[error("Concurrent update on VM {0}")]
    Conflict(VmId),

    #[error("External call failed: {0}")]
    TransientExternalFailure(AdapterError),

    #[error("External call failed permanently: {0}")]
    TerminalExternalFailure(AdapterError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// A deadline derived from this timestamp is out of range
    #[error("Invalid timestamp for VM {vm_id}: {timestamp}")]
    InvalidTimestamp {
        vm_id: VmId,
        timestamp: DateTime<Utc>,
    },
}

impl CoreError {
    pub fn from_adapter(err: AdapterError) -> Self {
        if err.is_terminal() {
            CoreError::TerminalExternalFailure(err)
        } else {
            CoreError::TransientExternalFailure(err)
        }
    }

    /// Whether handing the task back to the queue may help
    pub fn is_requeueable(&self) -> bool {
        matches!(self, CoreError::Store(_) | CoreError::Conflict(_))
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { id, .. } => CoreError::Conflict(VmId::new(id)),
            StoreError::NotFound(id) => CoreError::NotFound(VmId::new(id)),
            other => CoreError::Store(other),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors from handing a task to a dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The task was not accepted; nothing will run it
    #[error("Dispatcher unavailable: {0}")]
    Unavailable(String),

    /// The task ran and failed (inline dispatch only)
    #[error("Task failed: {0}")]
    Execution(Box<CoreError>),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

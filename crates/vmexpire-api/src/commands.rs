//! Command types for the vmexpired control protocol

use serde::{Deserialize, Serialize};
use vmexpire_util::{ClientId, ProjectId, VmId};

use crate::{ClientRole, HealthStatus, Page, RejectionReason, SweepSummary, VmCreatedEvent, VmRecord, API_VERSION};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    pub api_version: u32,
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    pub api_version: u32,
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    VmNotFound,
    /// Lost a concurrent update race too many times; safe to retry
    Conflict,
    PermissionDenied,
    StoreError,
    DispatchError,
    InternalError,
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// List tracked VMs
    ListVms {
        #[serde(default)]
        page: Page,
    },

    GetVm { vm_id: VmId },

    /// List VMs owned by one project
    ListProjectVms {
        project_id: ProjectId,
        #[serde(default)]
        page: Page,
    },

    /// Ask for more lifetime
    RequestExtension { vm_id: VmId, days: u32 },

    /// Report a newly created VM
    VmCreated { event: VmCreatedEvent },

    /// Get health status
    GetHealth,

    /// Subscribe to events (returns immediately, events stream separately)
    SubscribeEvents,

    /// Unsubscribe from events
    UnsubscribeEvents,

    // Admin commands

    /// Stop expiring a VM
    Exclude { vm_id: VmId },

    /// Resume expiring a VM
    Include { vm_id: VmId },

    /// Run a sweep now instead of waiting for the next tick
    RunSweep,

    /// Ping for keepalive
    Ping,
}

impl Command {
    /// Whether the command needs the admin role
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::Exclude { .. } | Command::Include { .. } | Command::RunSweep
        )
    }
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Vms(Vec<VmRecord>),
    Vm(VmRecord),
    /// The mutation was applied, carries the updated record
    Updated(VmRecord),
    /// The mutation was refused by policy
    Rejected { reason: RejectionReason },
    /// A created VM was accepted for registration
    CreationAccepted { vm_id: VmId },
    SweepFinished(SweepSummary),
    /// The sweep was skipped because another one is in flight
    SweepBusy,
    Health(HealthStatus),
    Subscribed { client_id: ClientId },
    Unsubscribed,
    Pong,
}

/// Client info (sent by server on connect)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
    /// Process ID if available
    pub pid: Option<u32>,
}

impl ClientInfo {
    pub fn new(role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid: None,
            pid: None,
        }
    }
}

//! Shared types for the vmexpired API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use vmexpire_util::{ProjectId, VmId};

/// Lifecycle status of a tracked VM
///
/// `Extended` is a transient marker used in audit records; the engine folds it
/// back into `Active` before persisting, so a stored record is never `Extended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Active,
    Notified,
    Extended,
    Expired,
    Deleting,
    Deleted,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Active => "active",
            VmStatus::Notified => "notified",
            VmStatus::Extended => "extended",
            VmStatus::Expired => "expired",
            VmStatus::Deleting => "deleting",
            VmStatus::Deleted => "deleted",
        }
    }

    /// Statuses the sweep looks at
    pub fn is_schedulable(&self) -> bool {
        matches!(self, VmStatus::Active | VmStatus::Notified | VmStatus::Expired)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VmStatus::Deleted)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("Unknown VM status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for VmStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(VmStatus::Active),
            "notified" => Ok(VmStatus::Notified),
            "extended" => Ok(VmStatus::Extended),
            "expired" => Ok(VmStatus::Expired),
            "deleting" => Ok(VmStatus::Deleting),
            "deleted" => Ok(VmStatus::Deleted),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One tracked VM and its lifecycle metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub vm_id: VmId,
    pub project_id: ProjectId,
    pub created_at: DateTime<Utc>,
    /// Absolute deadline after which deletion is due
    pub expires_at: DateTime<Utc>,
    /// Set once the pre-expiration warning has been sent
    pub notified_at: Option<DateTime<Utc>>,
    /// Number of extensions granted
    pub extend_count: u32,
    /// Sum of all granted extensions, in days
    pub extended_days: u32,
    pub status: VmStatus,
    /// Permanently skipped by the scheduler while set
    pub excluded: bool,
    /// Next time the scheduler has to look at this record
    pub due_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token, bumped by the store on every update
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Paging window for list queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default = "default_page_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

/// Default page size for list queries
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

/// Largest page a client may request
pub const MAX_PAGE_LIMIT: u32 = 100;

fn default_page_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

impl Page {
    /// Build a page, clamping the limit to `1..=MAX_PAGE_LIMIT`
    pub fn new(limit: u32, offset: u32) -> Self {
        Self {
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
            offset,
        }
    }

    /// Same page with the limit clamped; requests arrive unclamped off the wire
    pub fn clamped(self) -> Self {
        Self::new(self.limit, self.offset)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_LIMIT, 0)
    }
}

/// Kind of lifecycle message sent to a VM's owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// The VM will be deleted soon unless extended
    ExpirationWarning,
    /// An extension request was accepted
    ExtensionConfirmed,
    /// The VM has been deleted
    Deleted,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ExpirationWarning => "expiration_warning",
            NotificationKind::ExtensionConfirmed => "extension_confirmed",
            NotificationKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a mutation request was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectionReason {
    /// Granting the request would push cumulative extension past the ceiling
    CeilingExceeded {
        requested_days: u32,
        granted_days: u32,
        ceiling_days: u32,
    },
    /// The record is excluded from expiration, there is nothing to extend
    Excluded,
    /// The record's lifecycle no longer admits this request
    InvalidState { status: VmStatus },
    /// Zero-day extension
    InvalidDuration { requested_days: u32 },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::CeilingExceeded {
                requested_days,
                granted_days,
                ceiling_days,
            } => write!(
                f,
                "extension of {} days exceeds ceiling ({} of {} days already granted)",
                requested_days, granted_days, ceiling_days
            ),
            RejectionReason::Excluded => f.write_str("VM is excluded from expiration"),
            RejectionReason::InvalidState { status } => {
                write!(f, "not allowed while VM is {}", status)
            }
            RejectionReason::InvalidDuration { requested_days } => {
                write!(f, "invalid extension of {} days", requested_days)
            }
        }
    }
}

/// "VM created" notification from the compute provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmCreatedEvent {
    pub vm_id: VmId,
    pub project_id: ProjectId,
    pub created_at: DateTime<Utc>,
}

/// Outcome counters of one scheduler sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub started_at: Option<DateTime<Utc>>,
    /// Records returned by the due-time scan
    pub due: usize,
    pub notified: usize,
    pub expired: usize,
    pub deletions_dispatched: usize,
    /// Records skipped because of exclusion or nothing left to do
    pub skipped: usize,
    /// Lost optimistic-concurrency races, retried next tick
    pub conflicts: usize,
    pub failures: usize,
}

impl SweepSummary {
    pub fn transitions(&self) -> usize {
        self.notified + self.expired + self.deletions_dispatched
    }
}

/// Role for authorization on the control socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Can query records, request extensions and report created VMs
    Client,
    /// Can also manage exclusions and trigger sweeps
    Admin,
}

impl ClientRole {
    pub fn can_manage_exclusions(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }

    pub fn can_trigger_sweep(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub store_ok: bool,
    /// False once the task queue has refused work
    pub dispatcher_ok: bool,
    /// Tasks waiting in the durable queue (queued mode only)
    pub queue_depth: Option<u64>,
    pub last_sweep: Option<SweepSummary>,
}

//! VM record state machine
//!
//! Pure functions over [`VmRecord`]: no I/O, no clock. The engine reads a
//! record, asks for the next transition, applies it and writes the result back
//! with a compare-and-swap on `version`.
//!
//! ```text
//! ACTIVE --notify due--> NOTIFIED --expires--> EXPIRED --dispatch--> DELETING --> DELETED
//!   |  ^                     |                    ^                       |
//!   |  +----extension--------+                    +-------failure---------+
//!   +--------------------expires (no notice)------^
//! ```

use chrono::{DateTime, Utc};
use vmexpire_api::{RejectionReason, VmRecord, VmStatus};
use vmexpire_config::ExpirationPolicy;
use vmexpire_util::{days, ProjectId, VmId};

use crate::{CoreError, CoreResult};

/// How long an EXPIRED record waits before its delete goes out.
///
/// Keeps the delete off the sweep that wrote EXPIRED, so a sweep repeated at
/// the same instant finds nothing due.
fn delete_delay() -> chrono::Duration {
    chrono::Duration::seconds(1)
}

/// The single step a sweep may take for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// ACTIVE -> NOTIFIED, warning goes out
    Notify,
    /// ACTIVE/NOTIFIED -> EXPIRED
    Expire,
    /// EXPIRED -> DELETING, delete task goes out
    Delete,
}

/// Build the record for a freshly created VM.
///
/// Fails with [`CoreError::InvalidTimestamp`] when the deadline for
/// `created_at` falls outside the representable range.
pub fn new_record(
    vm_id: VmId,
    project_id: ProjectId,
    created_at: DateTime<Utc>,
    policy: &ExpirationPolicy,
    now: DateTime<Utc>,
) -> CoreResult<VmRecord> {
    let Some(expires_at) = created_at.checked_add_signed(policy.max_duration()) else {
        return Err(CoreError::InvalidTimestamp {
            vm_id,
            timestamp: created_at,
        });
    };

    let excluded = policy.is_project_excluded(&project_id);
    let mut record = VmRecord {
        vm_id,
        project_id,
        created_at,
        expires_at,
        notified_at: None,
        extend_count: 0,
        extended_days: 0,
        status: VmStatus::Active,
        excluded,
        due_at: None,
        version: 0,
        updated_at: now,
    };
    record.due_at = due_at(&record, policy);
    Ok(record)
}

/// When the warning for this record falls due, if one is still owed
pub fn notify_due_at(record: &VmRecord, policy: &ExpirationPolicy) -> Option<DateTime<Utc>> {
    if record.status != VmStatus::Active || record.notified_at.is_some() {
        return None;
    }
    policy.notify_before().map(|lead| {
        record
            .expires_at
            .checked_sub_signed(lead)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    })
}

/// Next time the scheduler has to look at the record
pub fn due_at(record: &VmRecord, policy: &ExpirationPolicy) -> Option<DateTime<Utc>> {
    if record.excluded {
        return None;
    }
    match record.status {
        VmStatus::Active => {
            Some(notify_due_at(record, policy).unwrap_or(record.expires_at))
        }
        VmStatus::Notified | VmStatus::Extended => Some(record.expires_at),
        VmStatus::Expired => Some(expired_due_at(record)),
        VmStatus::Deleting | VmStatus::Deleted => None,
    }
}

fn expired_due_at(record: &VmRecord) -> DateTime<Utc> {
    record
        .updated_at
        .checked_add_signed(delete_delay())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What a sweep at `now` should do with the record, if anything
pub fn next_transition(
    record: &VmRecord,
    policy: &ExpirationPolicy,
    now: DateTime<Utc>,
) -> Option<Transition> {
    if record.excluded || policy.is_project_excluded(&record.project_id) {
        return None;
    }

    match record.status {
        VmStatus::Active => {
            if notify_due_at(record, policy).is_some_and(|at| now >= at) {
                Some(Transition::Notify)
            } else if now >= record.expires_at {
                Some(Transition::Expire)
            } else {
                None
            }
        }
        VmStatus::Notified if now >= record.expires_at => Some(Transition::Expire),
        VmStatus::Expired if now >= expired_due_at(record) => Some(Transition::Delete),
        _ => None,
    }
}

fn touched(record: &VmRecord, now: DateTime<Utc>) -> VmRecord {
    let mut next = record.clone();
    next.updated_at = now;
    next
}

/// ACTIVE -> NOTIFIED.
///
/// A warning sent late, after the sweep missed the start of the notice window,
/// pushes the deadline out to a full notice period from `now`.
pub fn apply_notify(record: &VmRecord, policy: &ExpirationPolicy, now: DateTime<Utc>) -> VmRecord {
    let earliest_expiry = policy
        .notify_before()
        .map(|lead| now.checked_add_signed(lead).unwrap_or(DateTime::<Utc>::MAX_UTC))
        .unwrap_or(now);

    let mut next = touched(record, now);
    next.status = VmStatus::Notified;
    next.notified_at = Some(now);
    next.expires_at = next.expires_at.max(earliest_expiry);
    next.due_at = due_at(&next, policy);
    next
}

/// ACTIVE/NOTIFIED -> EXPIRED
pub fn apply_expire(record: &VmRecord, policy: &ExpirationPolicy, now: DateTime<Utc>) -> VmRecord {
    let mut next = touched(record, now);
    next.status = VmStatus::Expired;
    next.due_at = due_at(&next, policy);
    next
}

/// EXPIRED -> DELETING
pub fn apply_delete_dispatched(record: &VmRecord, now: DateTime<Utc>) -> VmRecord {
    let mut next = touched(record, now);
    next.status = VmStatus::Deleting;
    next.due_at = None;
    next
}

/// DELETING -> DELETED
pub fn apply_deleted(record: &VmRecord, now: DateTime<Utc>) -> VmRecord {
    let mut next = touched(record, now);
    next.status = VmStatus::Deleted;
    next.due_at = None;
    next
}

/// DELETING -> EXPIRED, so the next sweep dispatches again
pub fn apply_delete_failed(
    record: &VmRecord,
    policy: &ExpirationPolicy,
    now: DateTime<Utc>,
) -> VmRecord {
    apply_expire(record, policy, now)
}

/// Whether an extension of `requested_days` may be granted
pub fn check_extension(
    record: &VmRecord,
    policy: &ExpirationPolicy,
    requested_days: u32,
) -> Result<(), RejectionReason> {
    if requested_days == 0 {
        return Err(RejectionReason::InvalidDuration { requested_days });
    }
    if record.excluded || policy.is_project_excluded(&record.project_id) {
        return Err(RejectionReason::Excluded);
    }
    if !matches!(record.status, VmStatus::Active | VmStatus::Notified) {
        return Err(RejectionReason::InvalidState {
            status: record.status,
        });
    }

    let total = record.extended_days.saturating_add(requested_days);
    if total > policy.max_extend_days {
        return Err(RejectionReason::CeilingExceeded {
            requested_days,
            granted_days: record.extended_days,
            ceiling_days: policy.max_extend_days,
        });
    }
    if extended_deadline(record, requested_days).is_none() {
        return Err(RejectionReason::InvalidDuration { requested_days });
    }
    Ok(())
}

fn extended_deadline(record: &VmRecord, requested_days: u32) -> Option<DateTime<Utc>> {
    record.expires_at.checked_add_signed(days(requested_days))
}

/// Grant an extension, checking it with [`check_extension`] first.
///
/// Passes through EXTENDED and comes back ACTIVE; the warning is owed again
/// for the new deadline.
pub fn apply_extension(
    record: &VmRecord,
    policy: &ExpirationPolicy,
    requested_days: u32,
    now: DateTime<Utc>,
) -> Result<VmRecord, RejectionReason> {
    check_extension(record, policy, requested_days)?;
    let expires_at = extended_deadline(record, requested_days)
        .ok_or(RejectionReason::InvalidDuration { requested_days })?;

    let mut next = touched(record, now);
    next.expires_at = expires_at;
    next.notified_at = None;
    next.extend_count = record.extend_count + 1;
    next.extended_days = record.extended_days + requested_days;
    next.status = VmStatus::Active;
    next.due_at = due_at(&next, policy);
    Ok(next)
}

/// Whether the exclusion flag may still be changed
pub fn check_exclusion(record: &VmRecord) -> Result<(), RejectionReason> {
    match record.status {
        VmStatus::Deleting | VmStatus::Deleted => Err(RejectionReason::InvalidState {
            status: record.status,
        }),
        _ => Ok(()),
    }
}

pub fn apply_exclusion(
    record: &VmRecord,
    policy: &ExpirationPolicy,
    excluded: bool,
    now: DateTime<Utc>,
) -> VmRecord {
    let mut next = touched(record, now);
    next.excluded = excluded;
    next.due_at = due_at(&next, policy);
    next
}

/// Recompute the stored due time under the current policy
pub fn apply_recompute(record: &VmRecord, policy: &ExpirationPolicy, now: DateTime<Utc>) -> VmRecord {
    let mut next = touched(record, now);
    next.due_at = due_at(&next, policy);
    next
}

//! Status transitions for emergency requests.
//!
//! ```text
//! Pending ──accept()──> Accepted ──> EnRoute ──> Arrived ──> InProgress ──> Completed
//!    │                     │            │           │            │
//!    ├──> Expired          └────────────┴───────────┴────────────┴──> Cancelled
//!    └──> Cancelled
//! ```
//!
//! Completed, Cancelled and Expired are terminal. Everything here operates on an
//! in-memory snapshot; storage backends call these functions while holding the
//! row (or the store) exclusively, which is what makes the check and the write a
//! single compare-and-set.
//!
//! The expiry sweep is a bulk operation and moves `accepted` requests to
//! `expired` as well, outside the per-request table below.

use chrono::{DateTime, Utc};

use crate::domain::actor::{Actor, Role, UserId};
use crate::error::{Result, TowlineError};

use super::state::{EmergencyRequest, RequestId, RequestStatus};

/// Statuses reachable in one step from `from`.
pub fn allowed_targets(from: RequestStatus) -> &'static [RequestStatus] {
    use RequestStatus::*;
    match from {
        Pending => &[Accepted, Cancelled, Expired],
        Accepted => &[EnRoute, Cancelled],
        EnRoute => &[Arrived, Cancelled],
        Arrived => &[InProgress, Cancelled],
        InProgress => &[Completed, Cancelled],
        Completed | Cancelled | Expired => &[],
    }
}

pub fn can_transition(from: RequestStatus, to: RequestStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// Statuses swept to `expired` once a request is older than the age threshold.
pub const EXPIRABLE: [RequestStatus; 2] = [RequestStatus::Pending, RequestStatus::Accepted];

/// Error for an acceptance attempt on a request that is no longer pending.
///
/// A request that already has an assignee was lost to another service
/// (`AlreadyAssigned`). One that was cancelled or expired can never be accepted
/// (`InvalidTransition`).
pub fn accept_conflict(
    id: RequestId,
    status: RequestStatus,
    assignee: Option<UserId>,
) -> TowlineError {
    match assignee {
        Some(_) => TowlineError::AlreadyAssigned(id),
        None => TowlineError::InvalidTransition {
            id,
            from: status,
            to: RequestStatus::Accepted,
        },
    }
}

/// Claim a pending request for `service`.
///
/// On failure `request` is left untouched; see [`accept_conflict`] for the error.
pub fn accept(request: &mut EmergencyRequest, service: UserId, now: DateTime<Utc>) -> Result<()> {
    if !request.is_pending() {
        return Err(accept_conflict(
            request.id,
            request.status,
            request.assigned_service,
        ));
    }
    request.status = RequestStatus::Accepted;
    request.assigned_service = Some(service);
    request.accepted_at = Some(now);
    request.updated_at = now;
    Ok(())
}

/// Apply a table transition (anything other than acceptance) to `request`.
///
/// On error `request` is left unchanged.
pub fn transition(
    request: &mut EmergencyRequest,
    to: RequestStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    if to == RequestStatus::Accepted || !can_transition(request.status, to) {
        return Err(TowlineError::InvalidTransition {
            id: request.id,
            from: request.status,
            to,
        });
    }

    request.status = to;
    request.updated_at = now;
    match to {
        RequestStatus::Completed => request.completed_at = Some(now),
        RequestStatus::Cancelled | RequestStatus::Expired => request.assigned_service = None,
        _ => {}
    }
    Ok(())
}

/// Expire `request` if it is sweepable and was created before `cutoff`.
///
/// Returns whether the request changed.
pub fn expire_if_stale(
    request: &mut EmergencyRequest,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    if !EXPIRABLE.contains(&request.status) || request.created_at >= cutoff {
        return false;
    }
    request.status = RequestStatus::Expired;
    request.assigned_service = None;
    request.updated_at = now;
    true
}

/// Check that `actor` may move `request` to `to`.
///
/// Acceptance is gated on the towing-service role alone; the arbiter decides who wins.
pub fn authorize(actor: &Actor, request: &EmergencyRequest, to: RequestStatus) -> Result<()> {
    let is_assignee = request.assigned_service == Some(actor.id);
    let allowed = match to {
        RequestStatus::Accepted => actor.role == Role::TowingService,
        RequestStatus::EnRoute
        | RequestStatus::Arrived
        | RequestStatus::InProgress
        | RequestStatus::Completed => is_assignee || actor.is_admin(),
        RequestStatus::Cancelled => {
            request.requester == actor.id || is_assignee || actor.is_admin()
        }
        RequestStatus::Expired => actor.is_admin(),
        RequestStatus::Pending => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(TowlineError::Forbidden(format!(
            "{} may not move request {} to '{}'",
            actor.role, request.id, to
        )))
    }
}

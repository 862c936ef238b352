//! Core types for emergency requests.
//!
//! An [`EmergencyRequest`] moves through the statuses in [`RequestStatus`]. Unlike a
//! typestate machine, the target status of a transition arrives at runtime from the
//! caller, so the status is a plain enum and validity is checked against the
//! transition table in [`super::transitions`].

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::actor::UserId;
use crate::domain::geo::Coordinates;

/// Status of an emergency request.
///
/// Stored as lowercase snake_case text in the database's `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "text", rename_all = "snake_case")
)]
pub enum RequestStatus {
    Pending,
    Accepted,
    EnRoute,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
    Expired,
}

impl RequestStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [RequestStatus; 8] = [
        RequestStatus::Pending,
        RequestStatus::Accepted,
        RequestStatus::EnRoute,
        RequestStatus::Arrived,
        RequestStatus::InProgress,
        RequestStatus::Completed,
        RequestStatus::Cancelled,
        RequestStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::EnRoute => "en_route",
            RequestStatus::Arrived => "arrived",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Expired => "expired",
        }
    }

    /// Check if no further transition is permitted from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::Expired
        )
    }

    /// Check if a request in this status must carry an assigned service.
    pub fn requires_assignee(&self) -> bool {
        matches!(
            self,
            RequestStatus::Accepted
                | RequestStatus::EnRoute
                | RequestStatus::Arrived
                | RequestStatus::InProgress
                | RequestStatus::Completed
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = crate::error::TowlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                crate::error::TowlineError::Validation(format!("Unknown request status '{}'", s))
            })
    }
}

/// Unique identifier for an emergency request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Input for submitting a new emergency request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEmergencyRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub vehicle_details: String,
    pub problem_type: String,
    #[serde(default)]
    pub problem_description: Option<String>,
}

/// A driver's request for roadside assistance.
///
/// Snapshots are returned by value; mutation goes through the storage layer's
/// conditional updates so that concurrent callers never observe a lost update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyRequest {
    pub id: RequestId,
    /// The driver who submitted the request.
    pub requester: UserId,
    pub location: Coordinates,
    pub vehicle_details: String,
    pub problem_type: String,
    pub problem_description: Option<String>,
    pub status: RequestStatus,
    /// Set iff `status.requires_assignee()`.
    pub assigned_service: Option<UserId>,
    /// Services that declined this request. Kept apart from `status`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub declined_by: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_arrival_time: Option<DateTime<Utc>>,
    pub distance_km: Option<f64>,
}

impl EmergencyRequest {
    /// Build a fresh pending request.
    pub fn new_pending(
        requester: UserId,
        location: Coordinates,
        input: NewEmergencyRequest,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RequestId::from(Uuid::new_v4()),
            requester,
            location,
            vehicle_details: input.vehicle_details,
            problem_type: input.problem_type,
            problem_description: input.problem_description,
            status: RequestStatus::Pending,
            assigned_service: None,
            declined_by: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            accepted_at: None,
            completed_at: None,
            estimated_arrival_time: None,
            distance_km: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }

    /// Whether `service` has declined this request.
    pub fn is_declined_by(&self, service: UserId) -> bool {
        self.declined_by.contains(&service)
    }
}

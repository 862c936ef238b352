//! Driver ratings of a finished job.
//!
//! A requester may rate a request once, after it is completed. The rating is
//! credited to the towing service that was assigned at completion.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::actor::UserId;
use crate::domain::request::{EmergencyRequest, RequestId, RequestStatus};
use crate::error::{Result, TowlineError};

/// Lowest and highest score a rating may carry.
pub const RATING_RANGE: std::ops::RangeInclusive<u8> = 1..=5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RatingId(pub Uuid);

impl fmt::Display for RatingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RatingId {
    fn from(uuid: Uuid) -> Self {
        RatingId(uuid)
    }
}

impl std::ops::Deref for RatingId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRating {
    pub request_id: RequestId,
    pub rating: u8,
    #[serde(default)]
    pub review: Option<String>,
}

impl NewRating {
    pub fn validate(&self) -> Result<()> {
        if !RATING_RANGE.contains(&self.rating) {
            return Err(TowlineError::Validation(format!(
                "Rating must be between 1 and 5, got {}",
                self.rating
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub id: RatingId,
    pub request_id: RequestId,
    pub rater: UserId,
    /// Service that completed the job.
    pub towing_service: UserId,
    pub rating: u8,
    pub review: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Rating {
    /// Build a rating of `request` by `rater`.
    ///
    /// Fails unless `rater` is the requester and the request is completed with a
    /// service on record. Blank reviews are dropped.
    pub fn for_request(
        request: &EmergencyRequest,
        rater: UserId,
        input: NewRating,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        input.validate()?;
        if request.requester != rater {
            return Err(TowlineError::Forbidden(
                "You can only rate your own emergency requests".to_string(),
            ));
        }
        let towing_service = match (request.status, request.assigned_service) {
            (RequestStatus::Completed, Some(service)) => service,
            (status, _) => {
                return Err(TowlineError::InvalidState {
                    entity: format!("request {}", request.id),
                    actual: status.to_string(),
                    expected: RequestStatus::Completed.to_string(),
                });
            }
        };

        Ok(Self {
            id: RatingId(Uuid::new_v4()),
            request_id: request.id,
            rater,
            towing_service,
            rating: input.rating,
            review: input.review.filter(|r| !r.trim().is_empty()),
            created_at: now,
        })
    }
}

//! Storage trait for the dispatch core.
//!
//! This module defines the `Storage` trait, the only place shared mutable state lives.
//! Every write is either a single conditional update (acceptance) or a locked
//! read-modify-write of one row (everything else), so callers never need to
//! coordinate among themselves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::actor::{Actor, UserId};
use crate::domain::payment::{Payment, PaymentId, PaymentOutcome};
use crate::domain::rating::Rating;
use crate::domain::request::transitions;
use crate::domain::request::{EmergencyRequest, RequestId, RequestStatus};
use crate::error::{Result, TowlineError};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

/// Mutation applied to a request while the backend holds it exclusively.
///
/// If the closure returns an error nothing is written.
pub type RequestMutation<'a> = &'a (dyn Fn(&mut EmergencyRequest) -> Result<()> + Send + Sync);

/// Mutation applied to a payment while the backend holds it exclusively.
pub type PaymentMutation<'a> = &'a (dyn Fn(&mut Payment) -> Result<()> + Send + Sync);

/// Outcome of applying a gateway result to a payment.
#[derive(Debug, Clone)]
pub struct PaymentSettlement {
    pub payment: Payment,
    /// The linked request, if the payment moved it to `completed`.
    pub completed_request: Option<EmergencyRequest>,
}

/// Storage trait for persisting and querying emergency requests and payments.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a newly created pending request.
    async fn create_request(&self, request: EmergencyRequest) -> Result<EmergencyRequest>;

    /// Get a request snapshot by ID.
    async fn get_request(&self, id: RequestId) -> Result<EmergencyRequest>;

    /// List pending requests.
    ///
    /// If `latitude_band` is given, implementations may drop requests outside it.
    /// Results may lag concurrent writes; the arbiter has the final word.
    async fn list_open_requests(
        &self,
        latitude_band: Option<(f64, f64)>,
    ) -> Result<Vec<EmergencyRequest>>;

    /// Atomically claim a pending request for `service`.
    ///
    /// Implementations must perform the status check and the write as a single
    /// compare-and-set. Exactly one of any number of concurrent callers succeeds;
    /// the rest get `AlreadyAssigned`. Unknown ids give `NotFound`.
    async fn accept_request(&self, id: RequestId, service: UserId) -> Result<EmergencyRequest>;

    /// Add `service` to the request's declined set.
    ///
    /// Idempotent. Fails with `InvalidState` unless the request is pending.
    async fn reject_request(&self, id: RequestId, service: UserId) -> Result<()>;

    /// Run `mutate` against the current request while holding it exclusively, then
    /// write the result back. Returns the updated snapshot.
    async fn update_request(
        &self,
        id: RequestId,
        mutate: RequestMutation<'_>,
    ) -> Result<EmergencyRequest>;

    /// Move every pending/accepted request created before `cutoff` to expired.
    ///
    /// Returns the ids that changed. Idempotent.
    async fn expire_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<RequestId>>;

    /// Persist a new payment. The linked request must be `accepted` at commit time.
    async fn create_payment(&self, payment: Payment) -> Result<Payment>;

    /// Get a payment by ID.
    async fn get_payment(&self, id: PaymentId) -> Result<Payment>;

    /// Locked read-modify-write of a payment.
    async fn update_payment(&self, id: PaymentId, mutate: PaymentMutation<'_>) -> Result<Payment>;

    /// Apply a gateway outcome to a payment and, on success, complete the linked
    /// request if it is `in_progress`. Both writes commit together.
    async fn settle_payment(
        &self,
        id: PaymentId,
        outcome: PaymentOutcome,
        transaction_ref: Option<String>,
    ) -> Result<PaymentSettlement>;

    /// Persist a rating.
    ///
    /// The linked request must be `completed` at commit time (`InvalidState`
    /// otherwise) and may carry at most one rating (`Validation` on a second).
    async fn create_rating(&self, rating: Rating) -> Result<Rating>;

    /// Ratings credited to `service`, newest first.
    async fn ratings_for_service(&self, service: UserId) -> Result<Vec<Rating>>;

    /// Move a request to `to` on behalf of `actor`.
    ///
    /// Acceptance is routed through [`Storage::accept_request`]; every other target
    /// is authorized and checked against the transition table under the row lock.
    /// Accepting a request that is no longer pending is an `InvalidTransition` here,
    /// whoever holds it.
    #[tracing::instrument(skip(self, actor), fields(request_id = %id, to = %to, actor = %actor.id))]
    async fn transition_request(
        &self,
        id: RequestId,
        to: RequestStatus,
        actor: &Actor,
    ) -> Result<EmergencyRequest> {
        if to == RequestStatus::Accepted {
            if !actor.is_service() {
                return Err(TowlineError::Forbidden(
                    "Only towing services can accept requests".to_string(),
                ));
            }
            return match self.accept_request(id, actor.id).await {
                Err(TowlineError::AlreadyAssigned(_)) => {
                    let current = self.get_request(id).await?;
                    Err(TowlineError::InvalidTransition {
                        id,
                        from: current.status,
                        to,
                    })
                }
                other => other,
            };
        }

        let actor = *actor;
        self.update_request(id, &move |request| {
            transitions::authorize(&actor, request, to)?;
            transitions::transition(request, to, Utc::now())
        })
        .await
    }
}

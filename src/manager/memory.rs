//! In-memory implementation of Storage.
//!
//! All state sits behind one `parking_lot::RwLock`. Writers take the lock
//! exclusively for the whole check-and-write, which gives the same compare-and-set
//! guarantee the PostgreSQL backend gets from conditional updates and row locks.
//! Useful for tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{PaymentMutation, PaymentSettlement, RequestMutation, Storage};
use crate::domain::actor::UserId;
use crate::domain::payment::{Payment, PaymentId, PaymentOutcome, PaymentStatus};
use crate::domain::rating::Rating;
use crate::domain::request::transitions;
use crate::domain::request::{EmergencyRequest, RequestId, RequestStatus};
use crate::error::{Result, TowlineError};

#[derive(Default)]
struct Inner {
    requests: HashMap<RequestId, EmergencyRequest>,
    payments: HashMap<PaymentId, Payment>,
    ratings: HashMap<RequestId, Rating>,
}

/// Process-local storage backend.
#[derive(Default)]
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a stored request wholesale, bypassing transition checks.
    ///
    /// Intended for seeding fixtures (e.g. backdating `created_at`).
    pub fn put_request(&self, request: EmergencyRequest) {
        self.inner.write().requests.insert(request.id, request);
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_request(&self, request: EmergencyRequest) -> Result<EmergencyRequest> {
        let mut inner = self.inner.write();
        if inner.requests.contains_key(&request.id) {
            return Err(TowlineError::Validation(format!(
                "Request {} already exists",
                request.id
            )));
        }
        inner.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_request(&self, id: RequestId) -> Result<EmergencyRequest> {
        self.inner
            .read()
            .requests
            .get(&id)
            .cloned()
            .ok_or(TowlineError::NotFound(id))
    }

    async fn list_open_requests(
        &self,
        latitude_band: Option<(f64, f64)>,
    ) -> Result<Vec<EmergencyRequest>> {
        let inner = self.inner.read();
        Ok(inner
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .filter(|r| match latitude_band {
                Some((lo, hi)) => (lo..=hi).contains(&r.location.latitude()),
                None => true,
            })
            .cloned()
            .collect())
    }

    #[tracing::instrument(skip(self), fields(request_id = %id, service = %service))]
    async fn accept_request(&self, id: RequestId, service: UserId) -> Result<EmergencyRequest> {
        let mut inner = self.inner.write();
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or(TowlineError::NotFound(id))?;
        transitions::accept(request, service, Utc::now())?;
        Ok(request.clone())
    }

    async fn reject_request(&self, id: RequestId, service: UserId) -> Result<()> {
        let mut inner = self.inner.write();
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or(TowlineError::NotFound(id))?;
        if !request.is_pending() {
            return Err(TowlineError::InvalidState {
                entity: format!("request {}", id),
                actual: request.status.to_string(),
                expected: RequestStatus::Pending.to_string(),
            });
        }
        request.declined_by.insert(service);
        Ok(())
    }

    async fn update_request(
        &self,
        id: RequestId,
        mutate: RequestMutation<'_>,
    ) -> Result<EmergencyRequest> {
        let mut inner = self.inner.write();
        let stored = inner
            .requests
            .get_mut(&id)
            .ok_or(TowlineError::NotFound(id))?;
        // Mutate a copy so a failing closure leaves the stored request untouched
        let mut updated = stored.clone();
        mutate(&mut updated)?;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn expire_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<RequestId>> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        Ok(inner
            .requests
            .values_mut()
            .filter_map(|r| transitions::expire_if_stale(r, cutoff, now).then_some(r.id))
            .collect())
    }

    async fn create_payment(&self, payment: Payment) -> Result<Payment> {
        let mut inner = self.inner.write();
        let request = inner
            .requests
            .get(&payment.request_id)
            .ok_or(TowlineError::NotFound(payment.request_id))?;
        if request.status != RequestStatus::Accepted {
            return Err(TowlineError::InvalidState {
                entity: format!("request {}", request.id),
                actual: request.status.to_string(),
                expected: RequestStatus::Accepted.to_string(),
            });
        }
        inner.payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Payment> {
        self.inner
            .read()
            .payments
            .get(&id)
            .cloned()
            .ok_or(TowlineError::PaymentNotFound(id))
    }

    async fn update_payment(&self, id: PaymentId, mutate: PaymentMutation<'_>) -> Result<Payment> {
        let mut inner = self.inner.write();
        let stored = inner
            .payments
            .get_mut(&id)
            .ok_or(TowlineError::PaymentNotFound(id))?;
        let mut updated = stored.clone();
        mutate(&mut updated)?;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn settle_payment(
        &self,
        id: PaymentId,
        outcome: PaymentOutcome,
        transaction_ref: Option<String>,
    ) -> Result<PaymentSettlement> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        let mut payment = inner
            .payments
            .get(&id)
            .cloned()
            .ok_or(TowlineError::PaymentNotFound(id))?;
        payment.settle(outcome, transaction_ref, now)?;

        let mut completed_request = None;
        if payment.status == PaymentStatus::Completed
            && let Some(request) = inner.requests.get_mut(&payment.request_id)
            && request.status == RequestStatus::InProgress
        {
            transitions::transition(request, RequestStatus::Completed, now)?;
            completed_request = Some(request.clone());
        }

        inner.payments.insert(id, payment.clone());
        Ok(PaymentSettlement {
            payment,
            completed_request,
        })
    }

    async fn create_rating(&self, rating: Rating) -> Result<Rating> {
        let mut inner = self.inner.write();
        let request = inner
            .requests
            .get(&rating.request_id)
            .ok_or(TowlineError::NotFound(rating.request_id))?;
        if request.status != RequestStatus::Completed {
            return Err(TowlineError::InvalidState {
                entity: format!("request {}", request.id),
                actual: request.status.to_string(),
                expected: RequestStatus::Completed.to_string(),
            });
        }
        if inner.ratings.contains_key(&rating.request_id) {
            return Err(TowlineError::Validation(format!(
                "Request {} has already been rated",
                rating.request_id
            )));
        }
        inner.ratings.insert(rating.request_id, rating.clone());
        Ok(rating)
    }

    async fn ratings_for_service(&self, service: UserId) -> Result<Vec<Rating>> {
        let inner = self.inner.read();
        let mut ratings: Vec<Rating> = inner
            .ratings
            .values()
            .filter(|r| r.towing_service == service)
            .cloned()
            .collect();
        ratings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(ratings)
    }
}

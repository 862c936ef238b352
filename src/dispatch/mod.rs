//! Caller-facing dispatch operations.
//!
//! The [`Dispatcher`] is what a boundary layer (HTTP handlers, a CLI) talks to. It
//! takes the caller's identity explicitly, checks capabilities, and delegates the
//! actual state changes to a [`Storage`] backend. It holds no mutable state of its
//! own, so any number of calls can run concurrently.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::actor::{Actor, UserId};
use crate::domain::geo::{self, Coordinates};
use crate::domain::payment::{NewPayment, Payment, PaymentId, PaymentOutcome};
use crate::domain::rating::{NewRating, Rating};
use crate::domain::request::{EmergencyRequest, NewEmergencyRequest, RequestId, RequestStatus};
use crate::error::{Result, TowlineError};
use crate::manager::{PaymentSettlement, Storage};
use crate::notify::{NoopNotifier, Notification, Notifier};

pub mod sweeper;

pub use sweeper::{ExpirySweeper, SweeperConfig};

/// Configuration for the dispatcher.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Radius used when a candidate query does not specify one (km)
    pub default_radius_km: f64,

    /// Largest radius a candidate query may ask for (km). Unbounded if unset.
    pub max_radius_km: Option<f64>,

    /// Notify the requester on status changes after acceptance
    /// (en_route, arrived, in_progress, completed, cancelled)
    pub notify_status_changes: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_radius_km: geo::DEFAULT_RADIUS_KM,
            max_radius_km: None,
            notify_status_changes: true,
        }
    }
}

/// Dispatcher over a storage backend and a notifier.
pub struct Dispatcher<S, N = NoopNotifier>
where
    S: Storage,
    N: Notifier,
{
    storage: Arc<S>,
    notifier: Arc<N>,
    config: DispatchConfig,
    #[cfg(feature = "metrics")]
    prometheus: Option<crate::metrics::TowlineMetrics>,
}

impl<S: Storage> Dispatcher<S, NoopNotifier> {
    /// Create a dispatcher that sends no notifications.
    ///
    /// # Example
    /// ```ignore
    /// let dispatcher = Dispatcher::new(Arc::new(InMemoryStorage::new()))
    ///     .with_config(my_config);
    /// ```
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_notifier(storage, Arc::new(NoopNotifier))
    }
}

impl<S: Storage, N: Notifier> Dispatcher<S, N> {
    pub fn with_notifier(storage: Arc<S>, notifier: Arc<N>) -> Self {
        Self {
            storage,
            notifier,
            config: DispatchConfig::default(),
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    /// Set a custom dispatch configuration.
    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Also record into a Prometheus registry.
    #[cfg(feature = "metrics")]
    pub fn with_prometheus(mut self, metrics: crate::metrics::TowlineMetrics) -> Self {
        self.prometheus = Some(metrics);
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Submit a new emergency request on behalf of a driver.
    #[tracing::instrument(skip(self, input), fields(actor = %actor.id))]
    pub async fn create_request(
        &self,
        actor: &Actor,
        input: NewEmergencyRequest,
    ) -> Result<EmergencyRequest> {
        if actor.is_service() {
            return Err(TowlineError::Forbidden(
                "Towing services cannot submit emergency requests".to_string(),
            ));
        }
        let location = Coordinates::new(input.latitude, input.longitude)?;
        if input.problem_type.trim().is_empty() {
            return Err(TowlineError::Validation(
                "Problem type is required".to_string(),
            ));
        }

        let request = EmergencyRequest::new_pending(actor.id, location, input, Utc::now());
        let request = self.storage.create_request(request).await?;

        ::metrics::counter!("towline_requests_created_total").increment(1);
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.prometheus {
            m.record_request_created();
        }
        tracing::info!(request_id = %request.id, "Emergency request created");
        Ok(request)
    }

    pub async fn get_request(&self, id: RequestId) -> Result<EmergencyRequest> {
        self.storage.get_request(id).await
    }

    /// Pending requests near a towing service that it has not declined.
    ///
    /// `radius_km` defaults to the configured radius. The result is a snapshot: a
    /// request listed here may be accepted by someone else before this caller acts.
    #[tracing::instrument(skip(self), fields(actor = %actor.id))]
    pub async fn find_candidates(
        &self,
        actor: &Actor,
        latitude: f64,
        longitude: f64,
        radius_km: Option<f64>,
    ) -> Result<Vec<EmergencyRequest>> {
        if !actor.is_service() {
            return Err(TowlineError::Forbidden(
                "Only towing services can browse nearby requests".to_string(),
            ));
        }
        let origin = Coordinates::new(latitude, longitude)?;
        let radius_km = geo::validate_radius(radius_km.unwrap_or(self.config.default_radius_km))?;
        if let Some(max) = self.config.max_radius_km
            && radius_km > max
        {
            return Err(TowlineError::Validation(format!(
                "Search radius {} km exceeds the maximum of {} km",
                radius_km, max
            )));
        }

        let open = self
            .storage
            .list_open_requests(Some(geo::latitude_band(&origin, radius_km)))
            .await?;
        let scanned = open.len();
        let candidates = geo::filter_candidates(&origin, radius_km, actor.id, open);

        #[cfg(feature = "metrics")]
        if let Some(m) = &self.prometheus {
            m.record_candidates(candidates.len());
        }
        tracing::debug!(
            scanned,
            returned = candidates.len(),
            radius_km,
            "Computed candidate set"
        );
        Ok(candidates)
    }

    /// Claim a pending request. Exactly one concurrent caller wins.
    ///
    /// Losing the race is `AlreadyAssigned`; the caller should re-query candidates.
    /// A cancelled or expired request gives `InvalidTransition`.
    #[tracing::instrument(skip(self), fields(request_id = %request_id, actor = %actor.id))]
    pub async fn accept(&self, request_id: RequestId, actor: &Actor) -> Result<EmergencyRequest> {
        if !actor.is_service() {
            self.record_accept("rejected");
            return Err(TowlineError::Forbidden(
                "Only towing services can accept requests".to_string(),
            ));
        }

        match self.storage.accept_request(request_id, actor.id).await {
            Ok(request) => {
                self.record_accept("won");
                tracing::info!("Request accepted");
                self.notify(Notification::new(
                    request.requester,
                    request.id,
                    "Request Accepted",
                    "A towing service is on the way!",
                ))
                .await;
                Ok(request)
            }
            Err(e @ TowlineError::AlreadyAssigned(_)) => {
                self.record_accept("already_assigned");
                tracing::debug!("Acceptance lost to another service");
                Err(e)
            }
            Err(e @ TowlineError::InvalidTransition { .. }) => {
                self.record_accept("not_pending");
                tracing::debug!("Request closed before acceptance");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Decline a pending request so it stops appearing in this service's candidates.
    #[tracing::instrument(skip(self), fields(request_id = %request_id, actor = %actor.id))]
    pub async fn reject(&self, request_id: RequestId, actor: &Actor) -> Result<()> {
        if !actor.is_service() {
            return Err(TowlineError::Forbidden(
                "Only towing services can reject requests".to_string(),
            ));
        }
        self.storage.reject_request(request_id, actor.id).await?;
        tracing::info!("Request declined");
        Ok(())
    }

    /// Move a request to `to` on behalf of `actor`.
    #[tracing::instrument(skip(self), fields(request_id = %request_id, actor = %actor.id))]
    pub async fn transition(
        &self,
        request_id: RequestId,
        to: RequestStatus,
        actor: &Actor,
    ) -> Result<EmergencyRequest> {
        if to == RequestStatus::Accepted {
            return match self.accept(request_id, actor).await {
                Err(TowlineError::AlreadyAssigned(id)) => {
                    let current = self.storage.get_request(id).await?;
                    Err(TowlineError::InvalidTransition {
                        id,
                        from: current.status,
                        to,
                    })
                }
                other => other,
            };
        }

        let request = self.storage.transition_request(request_id, to, actor).await?;

        ::metrics::counter!("towline_transitions_total", "to" => to.as_str()).increment(1);
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.prometheus {
            m.record_transition(to.as_str());
        }
        tracing::info!(status = %to, "Request status changed");

        if self.config.notify_status_changes
            && let Some((title, body)) = status_message(to)
        {
            self.notify(Notification::new(request.requester, request.id, title, body))
                .await;
        }
        Ok(request)
    }

    /// Record the assigned service's estimated arrival and distance.
    #[tracing::instrument(skip(self), fields(request_id = %request_id, actor = %actor.id))]
    pub async fn update_progress(
        &self,
        request_id: RequestId,
        actor: &Actor,
        estimated_arrival_time: Option<DateTime<Utc>>,
        distance_km: Option<f64>,
    ) -> Result<EmergencyRequest> {
        if let Some(d) = distance_km
            && !(d.is_finite() && d >= 0.0)
        {
            return Err(TowlineError::Validation(format!(
                "Distance must be a non-negative number of kilometres, got {}",
                d
            )));
        }

        let actor = *actor;
        self.storage
            .update_request(request_id, &move |request| {
                if request.assigned_service != Some(actor.id) && !actor.is_admin() {
                    return Err(TowlineError::Forbidden(format!(
                        "Only the assigned service may update progress on request {}",
                        request.id
                    )));
                }
                if !matches!(
                    request.status,
                    RequestStatus::Accepted | RequestStatus::EnRoute | RequestStatus::Arrived
                ) {
                    return Err(TowlineError::InvalidState {
                        entity: format!("request {}", request.id),
                        actual: request.status.to_string(),
                        expected: "accepted, en_route or arrived".to_string(),
                    });
                }
                if estimated_arrival_time.is_some() {
                    request.estimated_arrival_time = estimated_arrival_time;
                }
                if distance_km.is_some() {
                    request.distance_km = distance_km;
                }
                request.updated_at = Utc::now();
                Ok(())
            })
            .await
    }

    /// Expire every pending/accepted request older than `max_age`.
    #[tracing::instrument(skip(self))]
    pub async fn expire_stale(&self, max_age: chrono::Duration) -> Result<Vec<RequestId>> {
        let cutoff = Utc::now().checked_sub_signed(max_age).ok_or_else(|| {
            TowlineError::Validation(format!("Expiry age {} is out of range", max_age))
        })?;
        let expired = self.storage.expire_stale(cutoff).await?;
        if !expired.is_empty() {
            ::metrics::counter!("towline_requests_expired_total")
                .increment(expired.len() as u64);
            #[cfg(feature = "metrics")]
            if let Some(m) = &self.prometheus {
                m.record_expired(expired.len());
            }
            tracing::info!(count = expired.len(), "Expired stale requests");
        }
        Ok(expired)
    }

    /// Open a payment for an accepted request. Only the requester (or an admin) pays.
    #[tracing::instrument(skip(self, input), fields(request_id = %input.request_id, actor = %actor.id))]
    pub async fn create_payment(&self, actor: &Actor, input: NewPayment) -> Result<Payment> {
        input.validate()?;
        let request = self.storage.get_request(input.request_id).await?;
        if request.requester != actor.id && !actor.is_admin() {
            return Err(TowlineError::Forbidden(
                "Only the requester can pay for a request".to_string(),
            ));
        }

        let payment = self
            .storage
            .create_payment(Payment::new_pending(request.requester, input, Utc::now()))
            .await?;
        tracing::info!(payment_id = %payment.id, amount_cents = payment.amount_cents, "Payment created");
        Ok(payment)
    }

    pub async fn get_payment(&self, id: PaymentId) -> Result<Payment> {
        self.storage.get_payment(id).await
    }

    /// The gateway has picked the payment up.
    pub async fn mark_payment_processing(&self, id: PaymentId) -> Result<Payment> {
        self.storage
            .update_payment(id, &|payment| payment.mark_processing(Utc::now()))
            .await
    }

    /// Apply the payment gateway's verdict.
    ///
    /// On success an `in_progress` request is completed in the same commit. A
    /// successful payment for a request in any other status stays completed and the
    /// request is left alone.
    #[tracing::instrument(skip(self, transaction_ref), fields(payment_id = %payment_id, outcome = ?outcome))]
    pub async fn payment_callback(
        &self,
        payment_id: PaymentId,
        outcome: PaymentOutcome,
        transaction_ref: Option<String>,
    ) -> Result<PaymentSettlement> {
        let settlement = self
            .storage
            .settle_payment(payment_id, outcome, transaction_ref)
            .await?;

        let outcome_label = match outcome {
            PaymentOutcome::Succeeded => "succeeded",
            PaymentOutcome::Failed => "failed",
        };
        ::metrics::counter!("towline_payments_settled_total", "outcome" => outcome_label)
            .increment(1);
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.prometheus {
            m.record_payment_settled(outcome_label);
        }

        match (&outcome, &settlement.completed_request) {
            (PaymentOutcome::Succeeded, Some(request)) => {
                tracing::info!(request_id = %request.id, "Payment completed request");
                self.notify(Notification::new(
                    request.requester,
                    request.id,
                    "Payment Received",
                    "Your payment went through and the job is complete.",
                ))
                .await;
            }
            (PaymentOutcome::Succeeded, None) => {
                tracing::warn!(
                    request_id = %settlement.payment.request_id,
                    "Payment succeeded but request was not in progress; request left unchanged"
                );
            }
            (PaymentOutcome::Failed, _) => {
                tracing::warn!(request_id = %settlement.payment.request_id, "Payment failed");
            }
        }
        Ok(settlement)
    }

    /// Refund a completed payment. Admin only.
    #[tracing::instrument(skip(self), fields(payment_id = %payment_id, actor = %actor.id))]
    pub async fn refund_payment(&self, actor: &Actor, payment_id: PaymentId) -> Result<Payment> {
        if !actor.is_admin() {
            return Err(TowlineError::Forbidden(
                "Only admins can refund payments".to_string(),
            ));
        }
        let payment = self
            .storage
            .update_payment(payment_id, &|payment| payment.refund(Utc::now()))
            .await?;
        tracing::info!("Payment refunded");
        Ok(payment)
    }

    /// Rate a completed request. Only its requester may, and only once.
    #[tracing::instrument(skip(self, input), fields(request_id = %input.request_id, actor = %actor.id))]
    pub async fn rate_request(&self, actor: &Actor, input: NewRating) -> Result<Rating> {
        let request = self.storage.get_request(input.request_id).await?;
        let rating = Rating::for_request(&request, actor.id, input, Utc::now())?;
        let rating = self.storage.create_rating(rating).await?;
        tracing::info!(
            towing_service = %rating.towing_service,
            rating = rating.rating,
            "Request rated"
        );
        Ok(rating)
    }

    pub async fn service_ratings(&self, service: UserId) -> Result<Vec<Rating>> {
        self.storage.ratings_for_service(service).await
    }

    fn record_accept(&self, outcome: &'static str) {
        ::metrics::counter!("towline_accept_attempts_total", "outcome" => outcome).increment(1);
        #[cfg(feature = "metrics")]
        if let Some(m) = &self.prometheus {
            m.record_accept_attempt(outcome);
        }
    }

    async fn notify(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(&notification).await {
            tracing::warn!(
                recipient = %notification.recipient,
                request_id = %notification.request_id,
                error = %e,
                "Failed to deliver notification"
            );
        }
    }
}

/// Push copy for status changes the requester cares about.
fn status_message(status: RequestStatus) -> Option<(&'static str, &'static str)> {
    match status {
        RequestStatus::EnRoute => Some(("Service En Route", "Your towing service is on its way.")),
        RequestStatus::Arrived => Some(("Service Arrived", "Your towing service has arrived.")),
        RequestStatus::InProgress => Some(("Work Started", "Your towing service has started work.")),
        RequestStatus::Completed => Some(("Job Completed", "Your request has been completed.")),
        RequestStatus::Cancelled => Some(("Request Cancelled", "Your request has been cancelled.")),
        RequestStatus::Pending | RequestStatus::Accepted | RequestStatus::Expired => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::{PaymentMethod, PaymentStatus};
    use crate::manager::memory::InMemoryStorage;
    use crate::notify::MockNotifier;
    use uuid::Uuid;

    fn setup() -> (Dispatcher<InMemoryStorage, MockNotifier>, Arc<MockNotifier>) {
        let notifier = Arc::new(MockNotifier::new());
        let dispatcher =
            Dispatcher::with_notifier(Arc::new(InMemoryStorage::new()), notifier.clone());
        (dispatcher, notifier)
    }

    fn driver() -> Actor {
        Actor::driver(UserId::from(Uuid::new_v4()))
    }

    fn service() -> Actor {
        Actor::towing_service(UserId::from(Uuid::new_v4()))
    }

    fn new_request(lat: f64, lon: f64) -> NewEmergencyRequest {
        NewEmergencyRequest {
            latitude: lat,
            longitude: lon,
            vehicle_details: "2018 F-150".to_string(),
            problem_type: "tow".to_string(),
            problem_description: None,
        }
    }

    #[tokio::test]
    async fn test_create_request_rejects_bad_input() {
        let (dispatcher, _) = setup();
        let err = dispatcher
            .create_request(&driver(), new_request(91.0, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, TowlineError::InvalidCoordinates(_)));

        let mut input = new_request(40.0, -73.0);
        input.problem_type = "  ".to_string();
        let err = dispatcher.create_request(&driver(), input).await.unwrap_err();
        assert!(matches!(err, TowlineError::Validation(_)));

        let err = dispatcher
            .create_request(&service(), new_request(40.0, -73.0))
            .await
            .unwrap_err();
        assert!(matches!(err, TowlineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_find_candidates_requires_service() {
        let (dispatcher, _) = setup();
        let err = dispatcher
            .find_candidates(&driver(), 40.0, -73.0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TowlineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_find_candidates_validates_inputs() {
        let (dispatcher, _) = setup();
        let svc = service();
        assert!(matches!(
            dispatcher.find_candidates(&svc, 40.0, 200.0, None).await,
            Err(TowlineError::InvalidCoordinates(_))
        ));
        assert!(matches!(
            dispatcher.find_candidates(&svc, 40.0, -73.0, Some(0.0)).await,
            Err(TowlineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_radius_cap_is_opt_in() {
        let (dispatcher, _) = setup();
        let requester = driver();
        // ~150 km east of the query point
        let far = dispatcher
            .create_request(&requester, new_request(40.0, -71.24))
            .await
            .unwrap();

        let found = dispatcher
            .find_candidates(&service(), 40.0, -73.0, Some(160.0))
            .await
            .unwrap();
        assert_eq!(found.iter().map(|r| r.id).collect::<Vec<_>>(), vec![far.id]);

        let capped = dispatcher.with_config(DispatchConfig {
            max_radius_km: Some(100.0),
            ..Default::default()
        });
        assert!(matches!(
            capped.find_candidates(&service(), 40.0, -73.0, Some(160.0)).await,
            Err(TowlineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_notifies_requester() {
        let (dispatcher, notifier) = setup();
        let requester = driver();
        let request = dispatcher
            .create_request(&requester, new_request(40.0, -73.0))
            .await
            .unwrap();

        dispatcher.accept(request.id, &service()).await.unwrap();

        let sent = notifier.sent_to(requester.id);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Request Accepted");
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_accept() {
        let (dispatcher, notifier) = setup();
        notifier.fail_deliveries(true);
        let request = dispatcher
            .create_request(&driver(), new_request(40.0, -73.0))
            .await
            .unwrap();

        let accepted = dispatcher.accept(request.id, &service()).await.unwrap();
        assert_eq!(accepted.status, RequestStatus::Accepted);
    }

    #[tokio::test]
    async fn test_driver_cannot_accept() {
        let (dispatcher, _) = setup();
        let request = dispatcher
            .create_request(&driver(), new_request(40.0, -73.0))
            .await
            .unwrap();
        let err = dispatcher.accept(request.id, &driver()).await.unwrap_err();
        assert!(matches!(err, TowlineError::Forbidden(_)));
        assert!(dispatcher.get_request(request.id).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_transition_to_accepted_routes_through_arbiter() {
        let (dispatcher, _) = setup();
        let request = dispatcher
            .create_request(&driver(), new_request(40.0, -73.0))
            .await
            .unwrap();
        let a = service();
        let b = service();

        dispatcher
            .transition(request.id, RequestStatus::Accepted, &a)
            .await
            .unwrap();
        let err = dispatcher
            .transition(request.id, RequestStatus::Accepted, &b)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TowlineError::InvalidTransition {
                from: RequestStatus::Accepted,
                to: RequestStatus::Accepted,
                ..
            }
        ));

        // the plain accept call still reports the lost race
        let err = dispatcher.accept(request.id, &b).await.unwrap_err();
        assert!(matches!(err, TowlineError::AlreadyAssigned(_)));
    }

    #[tokio::test]
    async fn test_accepting_cancelled_request_is_invalid_transition() {
        let (dispatcher, _) = setup();
        let requester = driver();
        let request = dispatcher
            .create_request(&requester, new_request(40.0, -73.0))
            .await
            .unwrap();
        dispatcher
            .transition(request.id, RequestStatus::Cancelled, &requester)
            .await
            .unwrap();

        for err in [
            dispatcher.accept(request.id, &service()).await.unwrap_err(),
            dispatcher
                .transition(request.id, RequestStatus::Accepted, &service())
                .await
                .unwrap_err(),
            dispatcher
                .storage()
                .transition_request(request.id, RequestStatus::Accepted, &service())
                .await
                .unwrap_err(),
        ] {
            assert!(
                matches!(
                    err,
                    TowlineError::InvalidTransition {
                        from: RequestStatus::Cancelled,
                        to: RequestStatus::Accepted,
                        ..
                    }
                ),
                "got {:?}",
                err
            );
        }
        assert_eq!(
            dispatcher.get_request(request.id).await.unwrap().status,
            RequestStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_update_progress_only_by_assignee() {
        let (dispatcher, _) = setup();
        let request = dispatcher
            .create_request(&driver(), new_request(40.0, -73.0))
            .await
            .unwrap();
        let assignee = service();
        dispatcher.accept(request.id, &assignee).await.unwrap();

        let eta = Utc::now() + chrono::Duration::minutes(20);
        let updated = dispatcher
            .update_progress(request.id, &assignee, Some(eta), Some(4.2))
            .await
            .unwrap();
        assert_eq!(updated.estimated_arrival_time, Some(eta));
        assert_eq!(updated.distance_km, Some(4.2));

        let err = dispatcher
            .update_progress(request.id, &service(), None, Some(1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, TowlineError::Forbidden(_)));

        let err = dispatcher
            .update_progress(request.id, &assignee, None, Some(-1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, TowlineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_payment_lifecycle() {
        let (dispatcher, notifier) = setup();
        let requester = driver();
        let assignee = service();
        let request = dispatcher
            .create_request(&requester, new_request(40.0, -73.0))
            .await
            .unwrap();
        dispatcher.accept(request.id, &assignee).await.unwrap();

        let input = NewPayment {
            request_id: request.id,
            amount_cents: 15_000,
            method: PaymentMethod::MobileMoney,
            notes: Some("highway tow".to_string()),
        };
        let err = dispatcher
            .create_payment(&driver(), input.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TowlineError::Forbidden(_)));

        let payment = dispatcher.create_payment(&requester, input).await.unwrap();
        dispatcher.mark_payment_processing(payment.id).await.unwrap();

        for to in [
            RequestStatus::EnRoute,
            RequestStatus::Arrived,
            RequestStatus::InProgress,
        ] {
            dispatcher.transition(request.id, to, &assignee).await.unwrap();
        }
        notifier.clear();

        let settlement = dispatcher
            .payment_callback(payment.id, PaymentOutcome::Succeeded, Some("gw-77".to_string()))
            .await
            .unwrap();
        assert_eq!(settlement.payment.status, PaymentStatus::Completed);
        assert_eq!(
            settlement.completed_request.unwrap().status,
            RequestStatus::Completed
        );
        assert_eq!(notifier.sent_to(requester.id)[0].title, "Payment Received");

        let err = dispatcher
            .refund_payment(&requester, payment.id)
            .await
            .unwrap_err();
        assert!(matches!(err, TowlineError::Forbidden(_)));
        let admin = Actor::admin(UserId::from(Uuid::new_v4()));
        let refunded = dispatcher.refund_payment(&admin, payment.id).await.unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
    }

    #[tokio::test]
    async fn test_payment_success_on_accepted_request_leaves_it_alone() {
        let (dispatcher, _) = setup();
        let requester = driver();
        let request = dispatcher
            .create_request(&requester, new_request(40.0, -73.0))
            .await
            .unwrap();
        dispatcher.accept(request.id, &service()).await.unwrap();
        let payment = dispatcher
            .create_payment(
                &requester,
                NewPayment {
                    request_id: request.id,
                    amount_cents: 5_000,
                    method: PaymentMethod::Card,
                    notes: None,
                },
            )
            .await
            .unwrap();

        let settlement = dispatcher
            .payment_callback(payment.id, PaymentOutcome::Succeeded, None)
            .await
            .unwrap();
        assert_eq!(settlement.payment.status, PaymentStatus::Completed);
        assert!(settlement.completed_request.is_none());
        assert_eq!(
            dispatcher.get_request(request.id).await.unwrap().status,
            RequestStatus::Accepted
        );
    }

    #[tokio::test]
    async fn test_rating_requires_completed_request_and_requester() {
        let (dispatcher, _) = setup();
        let requester = driver();
        let assignee = service();
        let request = dispatcher
            .create_request(&requester, new_request(40.0, -73.0))
            .await
            .unwrap();
        dispatcher.accept(request.id, &assignee).await.unwrap();

        let input = NewRating {
            request_id: request.id,
            rating: 4,
            review: Some("Arrived fast".to_string()),
        };
        let err = dispatcher
            .rate_request(&requester, input.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TowlineError::InvalidState { .. }));

        for to in [
            RequestStatus::EnRoute,
            RequestStatus::Arrived,
            RequestStatus::InProgress,
            RequestStatus::Completed,
        ] {
            dispatcher.transition(request.id, to, &assignee).await.unwrap();
        }

        let err = dispatcher
            .rate_request(&driver(), input.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TowlineError::Forbidden(_)));

        let rating = dispatcher.rate_request(&requester, input.clone()).await.unwrap();
        assert_eq!(rating.towing_service, assignee.id);
        assert_eq!(rating.rating, 4);

        let err = dispatcher.rate_request(&requester, input).await.unwrap_err();
        assert!(matches!(err, TowlineError::Validation(_)));

        let ratings = dispatcher.service_ratings(assignee.id).await.unwrap();
        assert_eq!(ratings, vec![rating]);
        assert!(dispatcher.service_ratings(service().id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_stale_rejects_out_of_range_age() {
        let (dispatcher, _) = setup();
        let request = dispatcher
            .create_request(&driver(), new_request(40.0, -73.0))
            .await
            .unwrap();

        let err = dispatcher
            .expire_stale(chrono::TimeDelta::try_days(200_000_000).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TowlineError::Validation(_)));
        assert!(dispatcher.get_request(request.id).await.unwrap().is_pending());
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_prometheus_records_accepts_and_sweeps() {
        use crate::metrics::TowlineMetrics;

        let metrics = TowlineMetrics::new(prometheus::Registry::new()).unwrap();
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::new(InMemoryStorage::new())).with_prometheus(metrics.clone()),
        );

        let request = dispatcher
            .create_request(&driver(), new_request(40.0, -73.0))
            .await
            .unwrap();
        dispatcher.accept(request.id, &service()).await.unwrap();
        dispatcher.accept(request.id, &service()).await.unwrap_err();

        let mut stale = dispatcher
            .create_request(&driver(), new_request(40.0, -73.0))
            .await
            .unwrap();
        stale.created_at = Utc::now() - chrono::Duration::hours(3);
        dispatcher.storage().put_request(stale.clone());

        let sweeper = ExpirySweeper::new(dispatcher.clone(), SweeperConfig::default());
        assert_eq!(sweeper.sweep_once().await.unwrap(), vec![stale.id]);

        let families = metrics.registry().gather();
        let counter = |name: &str, label: Option<&str>| -> f64 {
            families
                .iter()
                .find(|f| f.get_name() == name)
                .map(|f| {
                    f.get_metric()
                        .iter()
                        .filter(|m| match label {
                            Some(v) => m.get_label().iter().any(|l| l.get_value() == v),
                            None => true,
                        })
                        .map(|m| m.get_counter().get_value())
                        .sum()
                })
                .unwrap_or(0.0)
        };
        assert_eq!(counter("towline_accept_attempts_total", Some("won")), 1.0);
        assert_eq!(
            counter("towline_accept_attempts_total", Some("already_assigned")),
            1.0
        );
        assert_eq!(counter("towline_requests_expired_total", None), 1.0);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: DispatchConfig = serde_json::from_str(r#"{"default_radius_km": 15.0}"#).unwrap();
        assert_eq!(config.default_radius_km, 15.0);
        assert_eq!(config.max_radius_km, None);
        assert!(config.notify_status_changes);
    }
}

#![cfg(feature = "postgres")]

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use towline::manager::postgres::PostgresRequestManager;
use towline::{
    Actor, Coordinates, Dispatcher, EmergencyRequest, NewEmergencyRequest, NewPayment,
    NewRating, PaymentMethod, PaymentOutcome, PaymentStatus, PoolProvider, RequestStatus,
    Storage, TestDbPools, TowlineError, UserId,
};
use uuid::Uuid;

fn user() -> UserId {
    UserId::from(Uuid::new_v4())
}

fn breakdown_at(latitude: f64, longitude: f64) -> NewEmergencyRequest {
    NewEmergencyRequest {
        latitude,
        longitude,
        vehicle_details: "2019 Ford Transit".to_string(),
        problem_type: "tow".to_string(),
        problem_description: None,
    }
}

#[sqlx::test(migrations = "./migrations")]
#[test_log::test]
async fn test_create_and_fetch_roundtrips_fields(pool: sqlx::PgPool) {
    let dispatcher = Dispatcher::new(Arc::new(PostgresRequestManager::new(pool)));
    let driver = Actor::driver(user());

    let created = dispatcher
        .create_request(&driver, breakdown_at(40.7127753, -74.0059728))
        .await
        .unwrap();
    let fetched = dispatcher.get_request(created.id).await.unwrap();

    assert_eq!(fetched.id, created.id);
    assert_eq!(fetched.requester, driver.id);
    assert_eq!(fetched.status, RequestStatus::Pending);
    // six decimal places survive the NUMERIC column
    assert_eq!(fetched.location.latitude(), 40.712775);
    assert_eq!(fetched.location.longitude(), -74.005973);
    assert!(fetched.declined_by.is_empty());
}

#[sqlx::test(migrations = "./migrations")]
#[test_log::test]
async fn test_concurrent_accepts_have_exactly_one_winner(pool: sqlx::PgPool) {
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(PostgresRequestManager::new(pool))));
    let request = dispatcher
        .create_request(&Actor::driver(user()), breakdown_at(40.0, -73.0))
        .await
        .unwrap();

    let handles = (0..16).map(|_| {
        let dispatcher = dispatcher.clone();
        let service = Actor::towing_service(user());
        tokio::spawn(async move { dispatcher.accept(request.id, &service).await })
    });

    let mut won = 0;
    let mut lost = 0;
    for result in join_all(handles).await {
        match result.unwrap() {
            Ok(_) => won += 1,
            Err(TowlineError::AlreadyAssigned(_)) => lost += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(lost, 15);

    let stored = dispatcher.get_request(request.id).await.unwrap();
    assert_eq!(stored.status, RequestStatus::Accepted);
    assert!(stored.assigned_service.is_some());
}

#[sqlx::test(migrations = "./migrations")]
#[test_log::test]
async fn test_accept_unknown_request_is_not_found(pool: sqlx::PgPool) {
    let storage = PostgresRequestManager::new(pool);
    let missing = towline::RequestId::from(Uuid::new_v4());
    let err = storage.accept_request(missing, user()).await.unwrap_err();
    assert!(matches!(err, TowlineError::NotFound(id) if id == missing));
}

#[sqlx::test(migrations = "./migrations")]
#[test_log::test]
async fn test_candidates_from_replica(pool: sqlx::PgPool) {
    let pools = TestDbPools::new(pool).await.unwrap();
    let dispatcher = Dispatcher::new(Arc::new(PostgresRequestManager::new(pools)));
    let driver = Actor::driver(user());
    let near = dispatcher
        .create_request(&driver, breakdown_at(40.0, -73.0))
        .await
        .unwrap();
    // ~111 km north, outside the band entirely
    dispatcher
        .create_request(&driver, breakdown_at(41.0, -73.0))
        .await
        .unwrap();
    let declined = dispatcher
        .create_request(&driver, breakdown_at(40.01, -73.01))
        .await
        .unwrap();

    let service = Actor::towing_service(user());
    dispatcher.reject(declined.id, &service).await.unwrap();

    let candidates = dispatcher
        .find_candidates(&service, 40.05, -73.0, None)
        .await
        .unwrap();
    let ids: Vec<_> = candidates.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![near.id]);

    let stored = dispatcher.get_request(declined.id).await.unwrap();
    assert!(stored.is_declined_by(service.id));
    assert_eq!(stored.status, RequestStatus::Pending);
}

#[sqlx::test(migrations = "./migrations")]
#[test_log::test]
async fn test_transitions_are_checked_under_lock(pool: sqlx::PgPool) {
    let dispatcher = Dispatcher::new(Arc::new(PostgresRequestManager::new(pool)));
    let driver = Actor::driver(user());
    let service = Actor::towing_service(user());
    let request = dispatcher
        .create_request(&driver, breakdown_at(40.0, -73.0))
        .await
        .unwrap();
    dispatcher.accept(request.id, &service).await.unwrap();

    let err = dispatcher
        .transition(request.id, RequestStatus::Completed, &service)
        .await
        .unwrap_err();
    assert!(matches!(err, TowlineError::InvalidTransition { .. }));

    let eta = Utc::now() + Duration::minutes(15);
    let updated = dispatcher
        .update_progress(request.id, &service, Some(eta), Some(3.5))
        .await
        .unwrap();
    assert_eq!(updated.distance_km, Some(3.5));
    assert!(updated.estimated_arrival_time.is_some());

    let cancelled = dispatcher
        .transition(request.id, RequestStatus::Cancelled, &driver)
        .await
        .unwrap();
    assert_eq!(cancelled.status, RequestStatus::Cancelled);
    assert_eq!(cancelled.assigned_service, None);
}

#[sqlx::test(migrations = "./migrations")]
#[test_log::test]
async fn test_accepting_cancelled_request_is_invalid_transition(pool: sqlx::PgPool) {
    let dispatcher = Dispatcher::new(Arc::new(PostgresRequestManager::new(pool)));
    let driver = Actor::driver(user());
    let request = dispatcher
        .create_request(&driver, breakdown_at(40.0, -73.0))
        .await
        .unwrap();
    dispatcher
        .transition(request.id, RequestStatus::Cancelled, &driver)
        .await
        .unwrap();

    let err = dispatcher
        .accept(request.id, &Actor::towing_service(user()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TowlineError::InvalidTransition {
            from: RequestStatus::Cancelled,
            to: RequestStatus::Accepted,
            ..
        }
    ));

    let winner = Actor::towing_service(user());
    let open = dispatcher
        .create_request(&driver, breakdown_at(40.0, -73.0))
        .await
        .unwrap();
    dispatcher.accept(open.id, &winner).await.unwrap();
    let err = dispatcher
        .accept(open.id, &Actor::towing_service(user()))
        .await
        .unwrap_err();
    assert!(matches!(err, TowlineError::AlreadyAssigned(id) if id == open.id));
}

#[sqlx::test(migrations = "./migrations")]
#[test_log::test]
async fn test_expire_stale(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresRequestManager::new(pool));
    let dispatcher = Dispatcher::new(storage.clone());
    let old = dispatcher
        .create_request(&Actor::driver(user()), breakdown_at(40.0, -73.0))
        .await
        .unwrap();
    let fresh = dispatcher
        .create_request(&Actor::driver(user()), breakdown_at(40.0, -73.0))
        .await
        .unwrap();

    sqlx::query("UPDATE emergency_requests SET created_at = NOW() - INTERVAL '3 hours' WHERE id = $1")
        .bind(*old.id)
        .execute(storage.pools().write())
        .await
        .unwrap();

    let expired = dispatcher.expire_stale(Duration::hours(2)).await.unwrap();
    assert_eq!(expired, vec![old.id]);
    assert!(dispatcher.expire_stale(Duration::hours(2)).await.unwrap().is_empty());

    assert_eq!(
        storage.get_request(old.id).await.unwrap().status,
        RequestStatus::Expired
    );
    assert_eq!(
        storage.get_request(fresh.id).await.unwrap().status,
        RequestStatus::Pending
    );
}

#[sqlx::test(migrations = "./migrations")]
#[test_log::test]
async fn test_payment_completes_in_progress_request(pool: sqlx::PgPool) {
    let dispatcher = Dispatcher::new(Arc::new(PostgresRequestManager::new(pool)));
    let driver = Actor::driver(user());
    let service = Actor::towing_service(user());
    let request = dispatcher
        .create_request(&driver, breakdown_at(40.0, -73.0))
        .await
        .unwrap();
    dispatcher.accept(request.id, &service).await.unwrap();

    let payment = dispatcher
        .create_payment(
            &driver,
            NewPayment {
                request_id: request.id,
                amount_cents: 12_500,
                method: PaymentMethod::Card,
                notes: Some("flatbed".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);

    for to in [
        RequestStatus::EnRoute,
        RequestStatus::Arrived,
        RequestStatus::InProgress,
    ] {
        dispatcher.transition(request.id, to, &service).await.unwrap();
    }

    let settlement = dispatcher
        .payment_callback(payment.id, PaymentOutcome::Succeeded, Some("txn-4411".to_string()))
        .await
        .unwrap();
    assert_eq!(settlement.payment.status, PaymentStatus::Completed);
    assert_eq!(settlement.payment.transaction_ref.as_deref(), Some("txn-4411"));
    let completed = settlement.completed_request.unwrap();
    assert_eq!(completed.status, RequestStatus::Completed);
    assert!(completed.completed_at.is_some());

    let refunded = dispatcher
        .refund_payment(&Actor::admin(user()), payment.id)
        .await
        .unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);
}

#[sqlx::test(migrations = "./migrations")]
#[test_log::test]
async fn test_put_fixture_via_storage_then_expire(pool: sqlx::PgPool) {
    let storage = PostgresRequestManager::new(pool);
    let request = EmergencyRequest::new_pending(
        user(),
        Coordinates::new(40.0, -73.0).unwrap(),
        breakdown_at(40.0, -73.0),
        Utc::now() - Duration::hours(5),
    );
    storage.create_request(request.clone()).await.unwrap();

    let expired = storage.expire_stale(Utc::now() - Duration::hours(2)).await.unwrap();
    assert_eq!(expired, vec![request.id]);
}

#[sqlx::test(migrations = "./migrations")]
#[test_log::test]
async fn test_rating_completed_request(pool: sqlx::PgPool) {
    let dispatcher = Dispatcher::new(Arc::new(PostgresRequestManager::new(pool)));
    let driver = Actor::driver(user());
    let service = Actor::towing_service(user());
    let request = dispatcher
        .create_request(&driver, breakdown_at(40.0, -73.0))
        .await
        .unwrap();
    dispatcher.accept(request.id, &service).await.unwrap();

    let input = NewRating {
        request_id: request.id,
        rating: 3,
        review: Some("Took a while to find me".to_string()),
    };
    let err = dispatcher
        .rate_request(&driver, input.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, TowlineError::InvalidState { .. }));

    for to in [
        RequestStatus::EnRoute,
        RequestStatus::Arrived,
        RequestStatus::InProgress,
        RequestStatus::Completed,
    ] {
        dispatcher.transition(request.id, to, &service).await.unwrap();
    }

    let err = dispatcher
        .rate_request(&Actor::driver(user()), input.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, TowlineError::Forbidden(_)));

    let rating = dispatcher.rate_request(&driver, input.clone()).await.unwrap();
    let err = dispatcher.rate_request(&driver, input).await.unwrap_err();
    assert!(matches!(err, TowlineError::Validation(_)));

    let stored = dispatcher.service_ratings(service.id).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, rating.id);
    assert_eq!(stored[0].rating, 3);
    assert_eq!(stored[0].towing_service, service.id);
    assert_eq!(stored[0].review.as_deref(), Some("Took a while to find me"));
}

//! PostgreSQL implementation of Storage.
//!
//! Acceptance is a single conditional update:
//!
//! ```sql
//! UPDATE emergency_requests SET status = 'accepted', ... WHERE id = $1 AND status = 'pending'
//! ```
//!
//! and the affected-row count decides the race. Every other write opens a
//! transaction, takes `SELECT ... FOR UPDATE` on the target row, runs the domain
//! check in Rust, writes, and commits. Nothing here is read-then-write without a lock.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::{PaymentMutation, PaymentSettlement, RequestMutation, Storage};
use crate::domain::actor::UserId;
use crate::domain::geo::Coordinates;
use crate::domain::payment::{Payment, PaymentId, PaymentMethod, PaymentOutcome, PaymentStatus};
use crate::domain::rating::{Rating, RatingId};
use crate::domain::request::transitions;
use crate::domain::request::{EmergencyRequest, RequestId, RequestStatus};
use crate::error::{Result, TowlineError};

pub mod pool_provider;

pub use pool_provider::{PoolProvider, TestDbPools};

/// Columns selected for an [`EmergencyRequest`], against `emergency_requests r`.
const REQUEST_COLUMNS: &str = r#"
    r.id,
    r.requester_id,
    r.latitude::float8 AS latitude,
    r.longitude::float8 AS longitude,
    r.vehicle_details,
    r.problem_type,
    r.problem_description,
    r.status,
    r.assigned_service_id,
    ARRAY(
        SELECT d.service_id FROM request_declines d
        WHERE d.request_id = r.id
        ORDER BY d.service_id
    ) AS declined_by,
    r.created_at,
    r.updated_at,
    r.accepted_at,
    r.completed_at,
    r.estimated_arrival_time,
    r.distance_km
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, request_id, payer_id, amount_cents, method, status, transaction_ref, notes,
    created_at, updated_at, completed_at
"#;

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    requester_id: Uuid,
    latitude: f64,
    longitude: f64,
    vehicle_details: String,
    problem_type: String,
    problem_description: Option<String>,
    status: RequestStatus,
    assigned_service_id: Option<Uuid>,
    declined_by: Vec<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    accepted_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    estimated_arrival_time: Option<DateTime<Utc>>,
    distance_km: Option<f64>,
}

impl TryFrom<RequestRow> for EmergencyRequest {
    type Error = TowlineError;

    fn try_from(row: RequestRow) -> Result<Self> {
        Ok(EmergencyRequest {
            id: RequestId(row.id),
            requester: UserId(row.requester_id),
            location: Coordinates::new(row.latitude, row.longitude)?,
            vehicle_details: row.vehicle_details,
            problem_type: row.problem_type,
            problem_description: row.problem_description,
            status: row.status,
            assigned_service: row.assigned_service_id.map(UserId),
            declined_by: row.declined_by.into_iter().map(UserId).collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            accepted_at: row.accepted_at,
            completed_at: row.completed_at,
            estimated_arrival_time: row.estimated_arrival_time,
            distance_km: row.distance_km,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    request_id: Uuid,
    payer_id: Uuid,
    amount_cents: i64,
    method: PaymentMethod,
    status: PaymentStatus,
    transaction_ref: Option<String>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<PaymentRow> for Payment {
    fn from(row: PaymentRow) -> Self {
        Payment {
            id: PaymentId(row.id),
            request_id: RequestId(row.request_id),
            payer: UserId(row.payer_id),
            amount_cents: row.amount_cents,
            method: row.method,
            status: row.status,
            transaction_ref: row.transaction_ref,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RatingRow {
    id: Uuid,
    request_id: Uuid,
    rater_id: Uuid,
    towing_service_id: Uuid,
    rating: i16,
    review: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RatingRow> for Rating {
    type Error = TowlineError;

    fn try_from(row: RatingRow) -> Result<Self> {
        let rating = u8::try_from(row.rating).map_err(|_| {
            TowlineError::Other(anyhow!("Stored rating {} is out of range", row.rating))
        })?;
        Ok(Rating {
            id: RatingId(row.id),
            request_id: RequestId(row.request_id),
            rater: UserId(row.rater_id),
            towing_service: UserId(row.towing_service_id),
            rating,
            review: row.review,
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL implementation of the Storage trait.
///
/// # Example
/// ```ignore
/// use towline::PostgresRequestManager;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/towline").await?;
/// towline::migrator().run(&pool).await?;
/// let storage = Arc::new(PostgresRequestManager::new(pool));
/// let dispatcher = Dispatcher::new(storage);
/// ```
pub struct PostgresRequestManager<P: PoolProvider = PgPool> {
    pools: P,
}

impl<P: PoolProvider> PostgresRequestManager<P> {
    pub fn new(pools: P) -> Self {
        Self { pools }
    }

    /// Get the pool provider.
    pub fn pools(&self) -> &P {
        &self.pools
    }

    async fn fetch_request(&self, id: RequestId) -> Result<EmergencyRequest> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM emergency_requests r WHERE r.id = $1");
        let row: Option<RequestRow> = sqlx::query_as(&sql)
            .bind(*id)
            .fetch_optional(self.pools.write())
            .await
            .map_err(|e| TowlineError::Other(anyhow!("Failed to fetch request: {}", e)))?;
        row.ok_or(TowlineError::NotFound(id))?.try_into()
    }
}

/// Lock a request row for the rest of the transaction.
async fn lock_request(conn: &mut PgConnection, id: RequestId) -> Result<EmergencyRequest> {
    let sql = format!(
        "SELECT {REQUEST_COLUMNS} FROM emergency_requests r WHERE r.id = $1 FOR UPDATE OF r"
    );
    let row: Option<RequestRow> = sqlx::query_as(&sql)
        .bind(*id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| TowlineError::Other(anyhow!("Failed to lock request: {}", e)))?;
    row.ok_or(TowlineError::NotFound(id))?.try_into()
}

/// Write back the mutable columns of a request. The declined set is not touched.
async fn write_request(conn: &mut PgConnection, request: &EmergencyRequest) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE emergency_requests SET
            status = $2,
            assigned_service_id = $3,
            updated_at = $4,
            accepted_at = $5,
            completed_at = $6,
            estimated_arrival_time = $7,
            distance_km = $8
        WHERE id = $1
        "#,
    )
    .bind(*request.id)
    .bind(request.status)
    .bind(request.assigned_service.map(|s| s.0))
    .bind(request.updated_at)
    .bind(request.accepted_at)
    .bind(request.completed_at)
    .bind(request.estimated_arrival_time)
    .bind(request.distance_km)
    .execute(&mut *conn)
    .await
    .map_err(|e| TowlineError::Other(anyhow!("Failed to update request: {}", e)))?;
    Ok(())
}

async fn lock_payment(conn: &mut PgConnection, id: PaymentId) -> Result<Payment> {
    let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1 FOR UPDATE");
    let row: Option<PaymentRow> = sqlx::query_as(&sql)
        .bind(*id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| TowlineError::Other(anyhow!("Failed to lock payment: {}", e)))?;
    Ok(row.ok_or(TowlineError::PaymentNotFound(id))?.into())
}

async fn write_payment(conn: &mut PgConnection, payment: &Payment) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE payments SET
            status = $2,
            transaction_ref = $3,
            updated_at = $4,
            completed_at = $5
        WHERE id = $1
        "#,
    )
    .bind(*payment.id)
    .bind(payment.status)
    .bind(payment.transaction_ref.as_deref())
    .bind(payment.updated_at)
    .bind(payment.completed_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| TowlineError::Other(anyhow!("Failed to update payment: {}", e)))?;
    Ok(())
}

#[async_trait]
impl<P: PoolProvider> Storage for PostgresRequestManager<P> {
    async fn create_request(&self, request: EmergencyRequest) -> Result<EmergencyRequest> {
        sqlx::query(
            r#"
            INSERT INTO emergency_requests (
                id, requester_id, latitude, longitude, vehicle_details, problem_type,
                problem_description, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(*request.id)
        .bind(*request.requester)
        .bind(request.location.latitude())
        .bind(request.location.longitude())
        .bind(&request.vehicle_details)
        .bind(&request.problem_type)
        .bind(request.problem_description.as_deref())
        .bind(request.status)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(self.pools.write())
        .await
        .map_err(|e| TowlineError::Other(anyhow!("Failed to create request: {}", e)))?;

        tracing::debug!(request_id = %request.id, "Inserted emergency request");
        Ok(request)
    }

    async fn get_request(&self, id: RequestId) -> Result<EmergencyRequest> {
        self.fetch_request(id).await
    }

    async fn list_open_requests(
        &self,
        latitude_band: Option<(f64, f64)>,
    ) -> Result<Vec<EmergencyRequest>> {
        let (lo, hi) = latitude_band.unzip();
        let sql = format!(
            r#"
            SELECT {REQUEST_COLUMNS}
            FROM emergency_requests r
            WHERE r.status = 'pending'
              AND ($1::float8 IS NULL OR r.latitude >= $1)
              AND ($2::float8 IS NULL OR r.latitude <= $2)
            ORDER BY r.created_at, r.id
            "#
        );
        let rows: Vec<RequestRow> = sqlx::query_as(&sql)
            .bind(lo)
            .bind(hi)
            .fetch_all(self.pools.read())
            .await
            .map_err(|e| TowlineError::Other(anyhow!("Failed to list open requests: {}", e)))?;

        rows.into_iter().map(EmergencyRequest::try_from).collect()
    }

    #[tracing::instrument(skip(self), fields(request_id = %id, service = %service))]
    async fn accept_request(&self, id: RequestId, service: UserId) -> Result<EmergencyRequest> {
        let now = Utc::now();

        // Compare-and-set: only a row still in 'pending' matches
        let sql = format!(
            r#"
            UPDATE emergency_requests AS r SET
                status = 'accepted',
                assigned_service_id = $2,
                accepted_at = $3,
                updated_at = $3
            WHERE r.id = $1 AND r.status = 'pending'
            RETURNING {REQUEST_COLUMNS}
            "#
        );
        let row: Option<RequestRow> = sqlx::query_as(&sql)
            .bind(*id)
            .bind(*service)
            .bind(now)
            .fetch_optional(self.pools.write())
            .await
            .map_err(|e| TowlineError::Other(anyhow!("Failed to accept request: {}", e)))?;

        if let Some(row) = row {
            return row.try_into();
        }

        // Zero rows: the id is unknown, someone else got there first, or the
        // request was closed without an assignee
        let current: Option<(RequestStatus, Option<Uuid>)> = sqlx::query_as(
            "SELECT status, assigned_service_id FROM emergency_requests WHERE id = $1",
        )
        .bind(*id)
        .fetch_optional(self.pools.write())
        .await
        .map_err(|e| TowlineError::Other(anyhow!("Failed to read request status: {}", e)))?;

        match current {
            None => Err(TowlineError::NotFound(id)),
            Some((status, assignee)) => {
                tracing::debug!(status = %status, "Acceptance refused, request not pending");
                Err(transitions::accept_conflict(id, status, assignee.map(UserId)))
            }
        }
    }

    async fn reject_request(&self, id: RequestId, service: UserId) -> Result<()> {
        let mut tx = self.pools.write().begin().await.map_err(|e| {
            TowlineError::Other(anyhow!("Failed to begin transaction: {}", e))
        })?;

        let status: Option<RequestStatus> =
            sqlx::query_scalar("SELECT status FROM emergency_requests WHERE id = $1 FOR UPDATE")
                .bind(*id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| TowlineError::Other(anyhow!("Failed to lock request: {}", e)))?;

        match status {
            None => return Err(TowlineError::NotFound(id)),
            Some(RequestStatus::Pending) => {}
            Some(other) => {
                return Err(TowlineError::InvalidState {
                    entity: format!("request {}", id),
                    actual: other.to_string(),
                    expected: RequestStatus::Pending.to_string(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO request_declines (request_id, service_id)
            VALUES ($1, $2)
            ON CONFLICT (request_id, service_id) DO NOTHING
            "#,
        )
        .bind(*id)
        .bind(*service)
        .execute(&mut *tx)
        .await
        .map_err(|e| TowlineError::Other(anyhow!("Failed to record decline: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| TowlineError::Other(anyhow!("Failed to commit decline: {}", e)))?;
        Ok(())
    }

    async fn update_request(
        &self,
        id: RequestId,
        mutate: RequestMutation<'_>,
    ) -> Result<EmergencyRequest> {
        let mut tx = self.pools.write().begin().await.map_err(|e| {
            TowlineError::Other(anyhow!("Failed to begin transaction: {}", e))
        })?;

        let mut request = lock_request(&mut tx, id).await?;
        // Dropping the transaction on error rolls back and releases the lock
        mutate(&mut request)?;
        write_request(&mut tx, &request).await?;

        tx.commit()
            .await
            .map_err(|e| TowlineError::Other(anyhow!("Failed to commit request update: {}", e)))?;
        Ok(request)
    }

    async fn expire_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<RequestId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE emergency_requests SET
                status = 'expired',
                assigned_service_id = NULL,
                updated_at = $2
            WHERE status IN ('pending', 'accepted') AND created_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(Utc::now())
        .fetch_all(self.pools.write())
        .await
        .map_err(|e| TowlineError::Other(anyhow!("Failed to expire stale requests: {}", e)))?;

        Ok(ids.into_iter().map(RequestId).collect())
    }

    async fn create_payment(&self, payment: Payment) -> Result<Payment> {
        let mut tx = self.pools.write().begin().await.map_err(|e| {
            TowlineError::Other(anyhow!("Failed to begin transaction: {}", e))
        })?;

        let request = lock_request(&mut tx, payment.request_id).await?;
        if request.status != RequestStatus::Accepted {
            return Err(TowlineError::InvalidState {
                entity: format!("request {}", request.id),
                actual: request.status.to_string(),
                expected: RequestStatus::Accepted.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO payments (
                id, request_id, payer_id, amount_cents, method, status, notes,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(*payment.id)
        .bind(*payment.request_id)
        .bind(*payment.payer)
        .bind(payment.amount_cents)
        .bind(payment.method)
        .bind(payment.status)
        .bind(payment.notes.as_deref())
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| TowlineError::Other(anyhow!("Failed to create payment: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| TowlineError::Other(anyhow!("Failed to commit payment: {}", e)))?;
        Ok(payment)
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Payment> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        let row: Option<PaymentRow> = sqlx::query_as(&sql)
            .bind(*id)
            .fetch_optional(self.pools.write())
            .await
            .map_err(|e| TowlineError::Other(anyhow!("Failed to fetch payment: {}", e)))?;
        Ok(row.ok_or(TowlineError::PaymentNotFound(id))?.into())
    }

    async fn update_payment(&self, id: PaymentId, mutate: PaymentMutation<'_>) -> Result<Payment> {
        let mut tx = self.pools.write().begin().await.map_err(|e| {
            TowlineError::Other(anyhow!("Failed to begin transaction: {}", e))
        })?;

        let mut payment = lock_payment(&mut tx, id).await?;
        mutate(&mut payment)?;
        write_payment(&mut tx, &payment).await?;

        tx.commit()
            .await
            .map_err(|e| TowlineError::Other(anyhow!("Failed to commit payment update: {}", e)))?;
        Ok(payment)
    }

    #[tracing::instrument(skip(self, transaction_ref), fields(payment_id = %id, outcome = ?outcome))]
    async fn settle_payment(
        &self,
        id: PaymentId,
        outcome: PaymentOutcome,
        transaction_ref: Option<String>,
    ) -> Result<PaymentSettlement> {
        let now = Utc::now();
        let mut tx = self.pools.write().begin().await.map_err(|e| {
            TowlineError::Other(anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Payment row first, then its request
        let mut payment = lock_payment(&mut tx, id).await?;
        payment.settle(outcome, transaction_ref, now)?;
        write_payment(&mut tx, &payment).await?;

        let mut completed_request = None;
        if payment.status == PaymentStatus::Completed {
            let mut request = lock_request(&mut tx, payment.request_id).await?;
            if request.status == RequestStatus::InProgress {
                transitions::transition(&mut request, RequestStatus::Completed, now)?;
                write_request(&mut tx, &request).await?;
                completed_request = Some(request);
            }
        }

        tx.commit()
            .await
            .map_err(|e| TowlineError::Other(anyhow!("Failed to commit settlement: {}", e)))?;

        Ok(PaymentSettlement {
            payment,
            completed_request,
        })
    }

    async fn create_rating(&self, rating: Rating) -> Result<Rating> {
        let mut tx = self.pools.write().begin().await.map_err(|e| {
            TowlineError::Other(anyhow!("Failed to begin transaction: {}", e))
        })?;

        // Row lock serializes concurrent ratings of the same request
        let request = lock_request(&mut tx, rating.request_id).await?;
        if request.status != RequestStatus::Completed {
            return Err(TowlineError::InvalidState {
                entity: format!("request {}", request.id),
                actual: request.status.to_string(),
                expected: RequestStatus::Completed.to_string(),
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO ratings (
                id, request_id, rater_id, towing_service_id, rating, review, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(*rating.id)
        .bind(*rating.request_id)
        .bind(*rating.rater)
        .bind(*rating.towing_service)
        .bind(i16::from(rating.rating))
        .bind(rating.review.as_deref())
        .bind(rating.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| TowlineError::Other(anyhow!("Failed to create rating: {}", e)))?;

        if inserted.rows_affected() == 0 {
            return Err(TowlineError::Validation(format!(
                "Request {} has already been rated",
                rating.request_id
            )));
        }

        tx.commit()
            .await
            .map_err(|e| TowlineError::Other(anyhow!("Failed to commit rating: {}", e)))?;
        Ok(rating)
    }

    async fn ratings_for_service(&self, service: UserId) -> Result<Vec<Rating>> {
        let rows: Vec<RatingRow> = sqlx::query_as(
            r#"
            SELECT id, request_id, rater_id, towing_service_id, rating, review, created_at
            FROM ratings
            WHERE towing_service_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(*service)
        .fetch_all(self.pools.read())
        .await
        .map_err(|e| TowlineError::Other(anyhow!("Failed to list ratings: {}", e)))?;

        rows.into_iter().map(Rating::try_from).collect()
    }
}

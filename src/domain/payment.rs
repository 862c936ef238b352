//! Payment records attached to emergency requests.
//!
//! The crate never talks to a payment gateway. The gateway collaborator reports
//! the result through the payment callback, and a successful payment drives the
//! linked request to `completed` when that request is `in_progress`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::actor::UserId;
use crate::domain::request::RequestId;
use crate::error::{Result, TowlineError};

/// Unique identifier for a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub Uuid);

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for PaymentId {
    fn from(uuid: Uuid) -> Self {
        PaymentId(uuid)
    }
}

impl std::ops::Deref for PaymentId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "text", rename_all = "snake_case")
)]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Whether the gateway outcome is still outstanding.
    pub fn is_open(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "text", rename_all = "snake_case")
)]
pub enum PaymentMethod {
    Card,
    Cash,
    MobileMoney,
}

/// Result reported by the payment collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub request_id: RequestId,
    /// Amount in minor currency units (cents).
    pub amount_cents: i64,
    pub method: PaymentMethod,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewPayment {
    pub fn validate(&self) -> Result<()> {
        if self.amount_cents <= 0 {
            return Err(TowlineError::Validation(format!(
                "Payment amount must be positive, got {}",
                self.amount_cents
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub request_id: RequestId,
    pub payer: UserId,
    pub amount_cents: i64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    /// Reference assigned by the external gateway, once known.
    pub transaction_ref: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn new_pending(payer: UserId, input: NewPayment, now: DateTime<Utc>) -> Self {
        Self {
            id: PaymentId::from(Uuid::new_v4()),
            request_id: input.request_id,
            payer,
            amount_cents: input.amount_cents,
            method: input.method,
            status: PaymentStatus::Pending,
            transaction_ref: None,
            notes: input.notes,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn invalid_state(&self, expected: &str) -> TowlineError {
        TowlineError::InvalidState {
            entity: format!("payment {}", self.id),
            actual: self.status.to_string(),
            expected: expected.to_string(),
        }
    }

    /// pending -> processing.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != PaymentStatus::Pending {
            return Err(self.invalid_state("pending"));
        }
        self.status = PaymentStatus::Processing;
        self.updated_at = now;
        Ok(())
    }

    /// Apply a gateway outcome to an open payment.
    pub fn settle(
        &mut self,
        outcome: PaymentOutcome,
        transaction_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.is_open() {
            return Err(self.invalid_state("pending or processing"));
        }
        match outcome {
            PaymentOutcome::Succeeded => {
                self.status = PaymentStatus::Completed;
                self.completed_at = Some(now);
            }
            PaymentOutcome::Failed => self.status = PaymentStatus::Failed,
        }
        if transaction_ref.is_some() {
            self.transaction_ref = transaction_ref;
        }
        self.updated_at = now;
        Ok(())
    }

    /// completed -> refunded.
    pub fn refund(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != PaymentStatus::Completed {
            return Err(self.invalid_state("completed"));
        }
        self.status = PaymentStatus::Refunded;
        self.updated_at = now;
        Ok(())
    }
}

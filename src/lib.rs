//! Dispatch core for a roadside-towing marketplace.
//!
//! Drivers submit emergency requests with a location. Towing services ask for the
//! pending requests near them, then race to accept one; exactly one wins and the rest
//! are told the request is already assigned. The accepted job then moves through a
//! fixed status machine until it is completed, cancelled or expired. Once completed,
//! the driver can rate the service that did the job.
//!
//! The crate provides a [`Dispatcher`] in front of a [`Storage`] backend (in memory,
//! or PostgreSQL with the `postgres` feature) and an [`ExpirySweeper`] that runs in
//! the background.

pub mod dispatch;
pub mod domain;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod notify;
pub mod request;

// Re-export commonly used types
pub use dispatch::{DispatchConfig, Dispatcher, ExpirySweeper, SweeperConfig};
pub use domain::geo::{Coordinates, DEFAULT_RADIUS_KM};
pub use domain::payment::{
    NewPayment, Payment, PaymentId, PaymentMethod, PaymentOutcome, PaymentStatus,
};
pub use domain::rating::{NewRating, Rating, RatingId};
pub use error::{Result, TowlineError};
pub use manager::memory::InMemoryStorage;
#[cfg(feature = "postgres")]
pub use manager::postgres::{PoolProvider, PostgresRequestManager, TestDbPools};
pub use manager::{PaymentSettlement, Storage};
#[cfg(feature = "metrics")]
pub use crate::metrics::TowlineMetrics;
pub use notify::{FcmNotifier, MockNotifier, NoopNotifier, Notification, Notifier};
pub use request::*;

/// Get the towline database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

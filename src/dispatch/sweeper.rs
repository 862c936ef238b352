//! Background expiry of stale requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Dispatcher;
use crate::domain::request::RequestId;
use crate::error::{Result, TowlineError};
use crate::manager::Storage;
use crate::notify::{NoopNotifier, Notifier};

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// How often to run the sweep (milliseconds)
    pub sweep_interval_ms: u64,

    /// Pending/accepted requests older than this are expired (seconds)
    pub expiry_threshold_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
            expiry_threshold_secs: 2 * 60 * 60,
        }
    }
}

impl SweeperConfig {
    fn threshold(&self) -> Result<chrono::TimeDelta> {
        i64::try_from(self.expiry_threshold_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .ok_or_else(|| {
                TowlineError::Validation(format!(
                    "Expiry threshold of {} seconds is out of range",
                    self.expiry_threshold_secs
                ))
            })
    }
}

/// Periodically expires requests nobody finished in time.
///
/// Sweeps go through the [`Dispatcher`], so they show up in the same metrics as
/// calls made by hand.
pub struct ExpirySweeper<S, N = NoopNotifier>
where
    S: Storage,
    N: Notifier,
{
    dispatcher: Arc<Dispatcher<S, N>>,
    config: SweeperConfig,
}

impl<S, N> ExpirySweeper<S, N>
where
    S: Storage + 'static,
    N: Notifier + 'static,
{
    pub fn new(dispatcher: Arc<Dispatcher<S, N>>, config: SweeperConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Run a single sweep now.
    pub async fn sweep_once(&self) -> Result<Vec<RequestId>> {
        self.dispatcher.expire_stale(self.config.threshold()?).await
    }

    /// Spawn the sweep loop. It stops when `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms));
            tracing::info!(
                interval_ms = self.config.sweep_interval_ms,
                threshold_secs = self.config.expiry_threshold_secs,
                "Expiry sweeper started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            tracing::error!(error = %e, "Expiry sweep failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("Shutting down expiry sweeper");
                        break;
                    }
                }
            }
        })
    }
}

//! Notification dispatch to requesters.
//!
//! This module defines the `Notifier` trait so the dispatcher can tell a driver
//! their request was accepted (or moved along) without knowing how pushes are
//! delivered. Delivery failures never fail the operation that triggered them; the
//! dispatcher logs and moves on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::actor::UserId;
use crate::domain::request::RequestId;
use crate::error::{Result, TowlineError};

/// A message for one user about one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: UserId,
    pub request_id: RequestId,
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(
        recipient: UserId,
        request_id: RequestId,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient,
            request_id,
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Trait for delivering notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Notifier that drops everything. Default for dispatchers built without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Firebase Cloud Messaging
// ============================================================================

const FCM_SEND_URL: &str = "https://fcm.googleapis.com/fcm/send";

/// Push notifications through the FCM legacy HTTP API.
///
/// Device tokens are registered per user (typically at login). Users without a
/// token are skipped silently.
#[derive(Clone)]
pub struct FcmNotifier {
    client: reqwest::Client,
    server_key: String,
    endpoint: String,
    timeout_ms: u64,
    device_tokens: Arc<DashMap<UserId, String>>,
}

#[derive(Serialize)]
struct FcmMessage<'a> {
    to: &'a str,
    notification: FcmPayload<'a>,
    data: FcmData,
}

#[derive(Serialize)]
struct FcmPayload<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct FcmData {
    request_id: String,
}

impl FcmNotifier {
    pub fn new(server_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            server_key: server_key.into(),
            endpoint: FCM_SEND_URL.to_string(),
            timeout_ms: 5000,
            device_tokens: Arc::new(DashMap::new()),
        }
    }

    /// Point at a different send endpoint (e.g. a local stub).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Register or replace a user's device token. Empty tokens unregister.
    pub fn register_token(&self, user: UserId, token: impl Into<String>) {
        let token = token.into();
        if token.is_empty() {
            self.device_tokens.remove(&user);
        } else {
            self.device_tokens.insert(user, token);
        }
    }

    pub fn token_for(&self, user: UserId) -> Option<String> {
        self.device_tokens.get(&user).map(|t| t.value().clone())
    }
}

#[async_trait]
impl Notifier for FcmNotifier {
    #[tracing::instrument(skip(self, notification), fields(recipient = %notification.recipient, request_id = %notification.request_id))]
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let Some(token) = self.token_for(notification.recipient) else {
            tracing::debug!("No device token registered, skipping push");
            return Ok(());
        };

        let message = FcmMessage {
            to: &token,
            notification: FcmPayload {
                title: &notification.title,
                body: &notification.body,
            },
            data: FcmData {
                request_id: notification.request_id.0.to_string(),
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .timeout(Duration::from_millis(self.timeout_ms))
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "FCM request failed");
                TowlineError::Other(anyhow::anyhow!("FCM request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TowlineError::Other(anyhow::anyhow!(
                "FCM returned {}: {}",
                status,
                body
            )));
        }

        tracing::debug!(status = status.as_u16(), "Push delivered to FCM");
        Ok(())
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Mock notifier that records every notification it is handed.
///
/// # Example
/// ```ignore
/// let notifier = Arc::new(MockNotifier::new());
/// let dispatcher = Dispatcher::with_notifier(storage, notifier.clone());
/// // ...
/// assert_eq!(notifier.sent()[0].title, "Request Accepted");
/// ```
#[derive(Clone, Default)]
pub struct MockNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    fail: Arc<AtomicBool>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (after recording it).
    pub fn fail_deliveries(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, user: UserId) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.recipient == user)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().push(notification.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(TowlineError::Other(anyhow::anyhow!("Mock delivery failure")));
        }
        Ok(())
    }
}

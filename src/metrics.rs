//! Prometheus metrics for dispatch monitoring.
//!
//! The dispatcher always emits through the `metrics` facade (a no-op unless the
//! host installs a recorder). Hosts that scrape a `prometheus::Registry` directly
//! can additionally attach a [`TowlineMetrics`] with the `metrics` feature enabled.
//!
//! - **Counters**: requests created, acceptance attempts by outcome, transitions by
//!   target status, expirations, payments settled by outcome
//! - **Histograms**: candidate-set size per query

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Histogram, HistogramOpts, IntCounter, Opts, Registry};

#[cfg(feature = "metrics")]
use crate::error::Result;

/// Prometheus metrics registry for the dispatcher.
#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct TowlineMetrics {
    registry: Registry,

    requests_created_total: IntCounter,
    accept_attempts_total: CounterVec,
    transitions_total: CounterVec,
    requests_expired_total: IntCounter,
    payments_settled_total: CounterVec,

    candidates_returned: Histogram,
}

#[cfg(feature = "metrics")]
impl TowlineMetrics {
    /// Create and register all metrics with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics fail to register (e.g., duplicate registration).
    pub fn new(registry: Registry) -> Result<Self> {
        let requests_created_total = IntCounter::new(
            "towline_requests_created_total",
            "Total number of emergency requests submitted",
        )
        .map_err(|e| anyhow::anyhow!("Failed to create requests_created_total: {}", e))?;

        let accept_attempts_total = CounterVec::new(
            Opts::new(
                "towline_accept_attempts_total",
                "Acceptance attempts by outcome (won, already_assigned, not_pending, rejected)",
            ),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create accept_attempts_total: {}", e))?;

        let transitions_total = CounterVec::new(
            Opts::new(
                "towline_transitions_total",
                "Committed status transitions by target status",
            ),
            &["to"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create transitions_total: {}", e))?;

        let requests_expired_total = IntCounter::new(
            "towline_requests_expired_total",
            "Total number of requests moved to expired by the sweep",
        )
        .map_err(|e| anyhow::anyhow!("Failed to create requests_expired_total: {}", e))?;

        let payments_settled_total = CounterVec::new(
            Opts::new(
                "towline_payments_settled_total",
                "Payment callbacks applied, by outcome",
            ),
            &["outcome"],
        )
        .map_err(|e| anyhow::anyhow!("Failed to create payments_settled_total: {}", e))?;

        let candidates_returned = Histogram::with_opts(
            HistogramOpts::new(
                "towline_candidates_returned",
                "Number of candidate requests returned per proximity query",
            )
            .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
        )
        .map_err(|e| anyhow::anyhow!("Failed to create candidates_returned: {}", e))?;

        registry
            .register(Box::new(requests_created_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register requests_created_total: {}", e))?;
        registry
            .register(Box::new(accept_attempts_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register accept_attempts_total: {}", e))?;
        registry
            .register(Box::new(transitions_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register transitions_total: {}", e))?;
        registry
            .register(Box::new(requests_expired_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register requests_expired_total: {}", e))?;
        registry
            .register(Box::new(payments_settled_total.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register payments_settled_total: {}", e))?;
        registry
            .register(Box::new(candidates_returned.clone()))
            .map_err(|e| anyhow::anyhow!("Failed to register candidates_returned: {}", e))?;

        Ok(Self {
            registry,
            requests_created_total,
            accept_attempts_total,
            transitions_total,
            requests_expired_total,
            payments_settled_total,
            candidates_returned,
        })
    }

    /// Get the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_request_created(&self) {
        self.requests_created_total.inc();
    }

    /// Outcome should be one of `won`, `already_assigned`, `not_pending`, `rejected`.
    pub fn record_accept_attempt(&self, outcome: &str) {
        self.accept_attempts_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_transition(&self, to: &str) {
        self.transitions_total.with_label_values(&[to]).inc();
    }

    pub fn record_expired(&self, count: usize) {
        self.requests_expired_total.inc_by(count as u64);
    }

    pub fn record_payment_settled(&self, outcome: &str) {
        self.payments_settled_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_candidates(&self, count: usize) {
        self.candidates_returned.observe(count as f64);
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let _metrics = TowlineMetrics::new(registry.clone()).unwrap();
        assert!(TowlineMetrics::new(registry).is_err());
    }

    #[test]
    fn test_accept_attempts_by_outcome() {
        let metrics = TowlineMetrics::new(Registry::new()).unwrap();
        metrics.record_accept_attempt("won");
        metrics.record_accept_attempt("already_assigned");
        metrics.record_accept_attempt("already_assigned");

        let families = metrics.registry().gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "towline_accept_attempts_total")
            .unwrap();
        let total: f64 = family
            .get_metric()
            .iter()
            .map(|m| m.get_counter().get_value())
            .sum();
        assert_eq!(total, 3.0);
    }

    #[test]
    fn test_expired_counter_accumulates() {
        let metrics = TowlineMetrics::new(Registry::new()).unwrap();
        metrics.record_expired(2);
        metrics.record_expired(3);
        assert_eq!(metrics.requests_expired_total.get(), 5);
    }
}

//! Prometheus metrics and the HTTP endpoint serving them.
//!
//! `/metrics` returns the text exposition format, `/healthz` answers `ok`.

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use resource_store::ObjectKey;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Controller metrics, cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_duration: HistogramVec,
    pool_addresses: IntGaugeVec,
}

impl Metrics {
    /// Creates and registers all collectors
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("static_ip".to_string()), None)?;

        let reconciliations = IntCounterVec::new(
            Opts::new("reconciliations_total", "Reconciliations by resource kind and result."),
            &["kind", "result"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new("reconcile_duration_seconds", "Time spent in one reconciliation.")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["kind"],
        )?;
        let pool_addresses = IntGaugeVec::new(
            Opts::new("pool_addresses", "Addresses per pool by state (total, allocated, available)."),
            &["namespace", "pool", "state"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(pool_addresses.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            pool_addresses,
        })
    }

    /// Records one finished reconciliation
    pub fn observe_reconcile(&self, kind: &str, result: &str, elapsed: Duration) {
        self.reconciliations.with_label_values(&[kind, result]).inc();
        self.reconcile_duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    /// Publishes capacity counters of a pool
    pub fn set_pool_usage(&self, pool: &ObjectKey, total: u64, allocated: u64, available: u64) {
        for (state, value) in [("total", total), ("allocated", allocated), ("available", available)] {
            self.pool_addresses
                .with_label_values(&[pool.namespace.as_str(), pool.name.as_str(), state])
                .set(i64::try_from(value).unwrap_or(i64::MAX));
        }
    }

    /// Drops the series of a deleted pool
    pub fn forget_pool(&self, pool: &ObjectKey) {
        for state in ["total", "allocated", "available"] {
            // Absent series are fine
            let _ = self
                .pool_addresses
                .remove_label_values(&[pool.namespace.as_str(), pool.name.as_str(), state]);
        }
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

async fn metrics_endpoint(State(metrics): State<Metrics>) -> Response {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serves `/metrics` and `/healthz` until the token is cancelled
pub async fn serve(
    listener: TcpListener,
    metrics: Metrics,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_endpoint))
        .route("/healthz", get(healthz))
        .with_state(metrics);

    info!("Metrics endpoint listening on {:?}", listener.local_addr());
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        error!("Metrics endpoint stopped unexpectedly: {}", e);
        return Err(e);
    }
    info!("Metrics endpoint stopped");
    Ok(())
}

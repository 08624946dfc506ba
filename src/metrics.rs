//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Order reconciliation outcomes
//! - Chain action submissions
//! - Batch executor throughput
//! - Feed connectivity
//! - Recovery promotions

use crate::error::SettlerResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Reconciliation metrics
    pub static ref ORDERS_RECONCILED: CounterVec = register_counter_vec!(
        "settler_orders_reconciled_total",
        "Total reconciliation passes by outcome branch",
        &["account", "branch"]
    ).unwrap();

    // Chain action metrics
    pub static ref CHAIN_ACTIONS: CounterVec = register_counter_vec!(
        "settler_chain_actions_total",
        "Total chain actions by kind and outcome",
        &["chain", "kind", "outcome"]
    ).unwrap();

    pub static ref ACTION_LATENCY: HistogramVec = register_histogram_vec!(
        "settler_chain_action_latency_seconds",
        "Chain submission latency",
        &["chain", "kind"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    // Batch executor metrics
    pub static ref BATCH_BROADCASTS: CounterVec = register_counter_vec!(
        "settler_batch_broadcasts_total",
        "Total batch transactions broadcast",
        &[]
    ).unwrap();

    pub static ref BATCH_ACTIONS: CounterVec = register_counter_vec!(
        "settler_batch_actions_total",
        "Total actions settled through batch transactions",
        &[]
    ).unwrap();

    // Feed metrics
    pub static ref FEED_CONNECTED: GaugeVec = register_gauge_vec!(
        "settler_feed_connected",
        "Order feed connection status per account (1=connected)",
        &["account"]
    ).unwrap();

    pub static ref FEED_RECONNECTS: CounterVec = register_counter_vec!(
        "settler_feed_reconnects_total",
        "Total feed reconnect attempts per account",
        &["account"]
    ).unwrap();

    // Swap state metrics
    pub static ref OPEN_SWAPS: GaugeVec = register_gauge_vec!(
        "settler_open_swaps",
        "Locally-open swap records per account",
        &["account"]
    ).unwrap();

    pub static ref RECOVERY_PROMOTIONS: CounterVec = register_counter_vec!(
        "settler_recovery_promotions_total",
        "Failure records promoted by recovery",
        &["account"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "settler_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "settler_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SettlerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, app).await.unwrap();

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// Helper functions to record metrics

pub fn record_reconcile(account: &str, branch: &str) {
    ORDERS_RECONCILED.with_label_values(&[account, branch]).inc();
}

pub fn record_action(chain: &str, kind: &str, ok: bool) {
    let outcome = if ok { "submitted" } else { "failed" };
    CHAIN_ACTIONS
        .with_label_values(&[chain, kind, outcome])
        .inc();
}

pub fn record_action_latency(chain: &str, kind: &str, latency_secs: f64) {
    ACTION_LATENCY
        .with_label_values(&[chain, kind])
        .observe(latency_secs);
}

pub fn record_batch_broadcast(actions: usize) {
    BATCH_BROADCASTS.with_label_values(&[]).inc();
    BATCH_ACTIONS.with_label_values(&[]).inc_by(actions as f64);
}

pub fn record_feed_connected(account: &str, connected: bool) {
    FEED_CONNECTED
        .with_label_values(&[account])
        .set(if connected { 1.0 } else { 0.0 });
}

pub fn record_feed_reconnect(account: &str) {
    FEED_RECONNECTS.with_label_values(&[account]).inc();
}

pub fn record_open_swaps(account: &str, open: usize) {
    OPEN_SWAPS.with_label_values(&[account]).set(open as f64);
}

pub fn record_recovery_promotion(account: &str) {
    RECOVERY_PROMOTIONS.with_label_values(&[account]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Installs the Prometheus recorder for the `metrics` crate and serves the
/// exposition format on `addr`.
///
/// Must be called once per process, from within the runtime.
pub fn init_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("metrics: install Prometheus exporter")?;
    tracing::info!(metrics_addr = %addr, "metrics: listening");
    Ok(())
}

pub fn new_conn_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("c{n}")
}

/// Tracks one forwarded connection in the active gauge.
pub struct ActiveConnGuard;

impl ActiveConnGuard {
    pub fn new() -> Self {
        metrics::counter!("tunnelfwd_connections_total").increment(1);
        metrics::gauge!("tunnelfwd_active_connections").increment(1.0);
        Self
    }
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("tunnelfwd_active_connections").decrement(1.0);
    }
}

pub fn record_dial_failure() {
    metrics::counter!("tunnelfwd_dial_failures_total").increment(1);
}

pub fn record_relay_bytes(downstream_to_upstream: u64, upstream_to_downstream: u64) {
    metrics::counter!("tunnelfwd_bytes_upstream_total").increment(downstream_to_upstream);
    metrics::counter!("tunnelfwd_bytes_downstream_total").increment(upstream_to_downstream);
}

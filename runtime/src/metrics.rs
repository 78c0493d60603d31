//! Prometheus metrics for observability and monitoring.
//!
//! This module installs the global Prometheus recorder and describes the
//! runtime metrics emitted by the [`Store`](crate::Store):
//! - Reducer execution
//! - Effect handling
//! - Graceful shutdown
//!
//! Application crates describe their own business metrics on top of these.
//!
//! # Example
//!
//! ```rust,no_run
//! use slotbook_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! let body = server.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
    /// Failed to bind HTTP server
    #[error("Failed to bind metrics server: {0}")]
    Bind(#[from] std::io::Error),
}

/// Prometheus metrics server.
///
/// Owns the recorder handle used to render the scrape body. Serving the body
/// over HTTP is left to the application so it can share its router stack.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for the given scrape address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the scrape endpoint should listen on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Describe runtime metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests) this logs a warning,
    /// returns `Ok(())` and leaves [`handle`](Self::handle) empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed - scrape at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register descriptions for the metrics the store emits.
fn register_metrics() {
    describe_counter!("store.commands.total", "Total number of actions sent to stores");
    describe_histogram!(
        "store.reducer.duration_seconds",
        "Time spent inside reducers while holding the state lock"
    );
    describe_histogram!("store.effects.count", "Number of effects returned per action");
    describe_counter!("store.effects.executed", "Effects executed, labelled by type");
    describe_gauge!("store.effects.pending", "Effects currently running");
    describe_counter!("store.shutdown.initiated", "Graceful shutdowns started");
    describe_counter!("store.shutdown.completed", "Graceful shutdowns that drained in time");
    describe_counter!("store.shutdown.timeout", "Graceful shutdowns that timed out");
    describe_counter!(
        "store.shutdown.rejected_actions",
        "Actions rejected because the store was shutting down"
    );
    describe_counter!("store.observers.lagged", "Actions skipped by lagging observers");
}

/// Reducer metrics recorder.
pub struct ReducerMetrics;

impl ReducerMetrics {
    /// Record an action processed.
    pub fn record_action(duration: Duration) {
        counter!("store.commands.total").increment(1);
        histogram!("store.reducer.duration_seconds").record(duration.as_secs_f64());
    }

    /// Record how many effects one action produced.
    #[allow(clippy::cast_precision_loss)] // effect counts are tiny
    pub fn record_effects(count: usize) {
        histogram!("store.effects.count").record(count as f64);
    }
}

/// Effect metrics recorder.
pub struct EffectMetrics;

impl EffectMetrics {
    /// Record an effect execution by kind (`future`, `delay`, ...).
    pub fn record_execution(kind: &'static str) {
        counter!("store.effects.executed", "type" => kind).increment(1);
    }

    /// Record the current number of pending effects.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_pending(pending: usize) {
        gauge!("store.effects.pending").set(pending as f64);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[test]
    fn test_metrics_server_start_and_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);

        server.start().unwrap();

        ReducerMetrics::record_action(Duration::from_millis(2));
        EffectMetrics::record_execution("future");

        // Another test may have installed the recorder first; metrics are
        // still recorded globally in that case.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("store_commands_total"));
        }
    }

    #[test]
    fn test_start_twice_is_tolerated() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut first = MetricsServer::new(addr);
        let mut second = MetricsServer::new(addr);

        assert!(first.start().is_ok());
        assert!(second.start().is_ok());
    }
}

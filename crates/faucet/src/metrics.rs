//! Prometheus metrics for the faucet

use crate::error::{FaucetError, FaucetResult};
use prometheus::{
    histogram_opts, opts, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

/// Faucet metrics, each instance with its own registry
#[derive(Clone)]
pub struct FaucetMetrics {
    registry: Registry,

    /// Funding requests by outcome (`admitted`, `invalid`, `rate_limited`, `busy`, `error`)
    pub requests_total: IntCounterVec,
    /// Dispatch cycles by outcome (`empty`, `skipped`, `succeeded`, `failed`)
    pub dispatch_cycles_total: IntCounterVec,
    pub recipients_paid_total: IntCounter,
    pub queue_depth: IntGauge,
    pub broadcast_duration: Histogram,
}

impl FaucetMetrics {
    pub fn new() -> FaucetResult<Self> {
        let registry = Registry::new_custom(Some("faucet".to_string()), None).map_err(metrics_error)?;

        let requests_total = IntCounterVec::new(
            opts!("requests_total", "Funding requests by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let dispatch_cycles_total = IntCounterVec::new(
            opts!("dispatch_cycles_total", "Dispatch cycles by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let recipients_paid_total = IntCounter::with_opts(opts!(
            "recipients_paid_total",
            "Queue entries paid by a landed batch"
        ))
        .map_err(metrics_error)?;
        let queue_depth = IntGauge::with_opts(opts!("queue_depth", "Pending queue entries"))
            .map_err(metrics_error)?;
        let broadcast_duration = Histogram::with_opts(histogram_opts!(
            "broadcast_duration_seconds",
            "Time spent waiting for a broadcast verdict",
            vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        ))
        .map_err(metrics_error)?;

        registry
            .register(Box::new(requests_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(dispatch_cycles_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(recipients_paid_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(broadcast_duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            requests_total,
            dispatch_cycles_total,
            recipients_paid_total,
            queue_depth,
            broadcast_duration,
        })
    }

    pub fn record_request(&self, outcome: &str) {
        self.requests_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_cycle(&self, outcome: &str) {
        self.dispatch_cycles_total.with_label_values(&[outcome]).inc();
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather(&self) -> FaucetResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| FaucetError::Internal(e.to_string()))
    }
}

fn metrics_error(err: prometheus::Error) -> FaucetError {
    FaucetError::Internal(format!("Metrics error: {}", err))
}

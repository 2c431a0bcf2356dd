//! Prometheus metrics for the dequeue pipeline

use courier_common::types::DeliveryStatus;
use courier_common::{Error, Result};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// Pipeline metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Seconds between enqueue and the start of a dequeue run
    queue_latency: Histogram,
    /// Deliveries recorded, labelled by status
    deliveries: IntCounterVec,
    /// Dequeue runs started
    dequeue_runs: IntCounter,
}

impl Metrics {
    /// Create the collectors and register them with a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let queue_latency = Histogram::with_opts(
            HistogramOpts::new(
                "courier_message_queue_latency_seconds",
                "Time messages spend in the queue before a dequeue run picks them up",
            )
            .buckets(vec![
                0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 21600.0, 86400.0,
            ]),
        )
        .map_err(metrics_err)?;

        let deliveries = IntCounterVec::new(
            Opts::new("courier_deliveries_total", "Deliveries recorded by status"),
            &["status"],
        )
        .map_err(metrics_err)?;

        let dequeue_runs = IntCounter::new("courier_dequeue_runs_total", "Dequeue runs started")
            .map_err(metrics_err)?;

        registry
            .register(Box::new(queue_latency.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(deliveries.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(dequeue_runs.clone()))
            .map_err(metrics_err)?;

        Ok(Self {
            registry,
            queue_latency,
            deliveries,
            dequeue_runs,
        })
    }

    /// Registry holding every collector, for an exporter to gather
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn observe_queue_latency(&self, seconds: f64) {
        self.queue_latency.observe(seconds.max(0.0));
    }

    pub fn record_delivery(&self, status: DeliveryStatus) {
        self.deliveries.with_label_values(&[status.as_str()]).inc();
    }

    pub fn dequeue_started(&self) {
        self.dequeue_runs.inc();
    }

    pub fn deliveries_with_status(&self, status: DeliveryStatus) -> u64 {
        self.deliveries.with_label_values(&[status.as_str()]).get()
    }

    pub fn dequeue_runs(&self) -> u64 {
        self.dequeue_runs.get()
    }
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.dequeue_started();
        metrics.record_delivery(DeliveryStatus::Sent);
        metrics.record_delivery(DeliveryStatus::Sent);
        metrics.observe_queue_latency(2.5);

        assert_eq!(metrics.dequeue_runs(), 1);
        assert_eq!(metrics.deliveries_with_status(DeliveryStatus::Sent), 2);
        assert_eq!(metrics.deliveries_with_status(DeliveryStatus::HardFail), 0);
        assert_eq!(metrics.registry().gather().len(), 3);
    }
}

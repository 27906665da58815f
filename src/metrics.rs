//! Attacher Metrics
//!
//! Prometheus metrics for driver calls and leadership, kept in a dedicated
//! registry served at `/metrics`.

use crate::error::Result;
use crate::leaderelection::LeadershipState;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

pub const NAMESPACE: &str = "csi_attacher";

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    operations: IntCounterVec,
    operation_duration: HistogramVec,
    leader: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Driver operations by outcome").namespace(NAMESPACE),
            &["operation", "result"],
        )?;
        registry.register(Box::new(operations.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Latency of driver operations")
                .namespace(NAMESPACE)
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0, 60.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let leader = IntGauge::with_opts(
            Opts::new("leader", "1 while this replica holds the leader lock").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(leader.clone()))?;

        Ok(Self {
            registry,
            operations,
            operation_duration,
            leader,
        })
    }

    /// Record one attach or detach call
    pub fn record_operation(&self, operation: &str, success: bool, elapsed: Duration) {
        let result = if success { "success" } else { "error" };
        self.operations
            .with_label_values(&[operation, result])
            .inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_leadership(&self, state: LeadershipState) {
        self.leader
            .set(i64::from(state == LeadershipState::Held));
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

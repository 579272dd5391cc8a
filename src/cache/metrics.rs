//! Binder Metrics
//!
//! Prometheus collectors registered in a per-controller registry, so
//! several controllers (tests) can coexist in one process.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "volume_binder";

/// Collectors for the reconciliation loops
#[derive(Clone)]
pub struct BinderMetrics {
    registry: Registry,
    /// Bind attempts by outcome (`bound`, `conflict`, `no_match`)
    pub bind_attempts: IntCounterVec,
    /// Optimistic-concurrency rejections by kind
    pub conflicts: IntCounterVec,
    /// Phase transitions written by the binder
    pub phase_transitions: IntCounterVec,
    /// Provisioning outcomes (`success`, `failure`, `exhausted`)
    pub provisioning: IntCounterVec,
    /// Reclaim outcomes by policy and result
    pub reclaims: IntCounterVec,
    /// Keys waiting per queue
    pub queue_depth: IntGaugeVec,
    /// Reconcile pass duration by kind
    pub reconcile_duration: HistogramVec,
    /// Informer relists after watch failures
    pub relists: IntCounter,
}

fn register<C: prometheus::core::Collector + Clone + 'static>(
    registry: &Registry,
    collector: C,
) -> Result<C> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| Error::Internal(format!("metric registration failed: {}", e)))?;
    Ok(collector)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
        .map_err(|e| Error::Internal(format!("invalid metric {}: {}", name, e)))
}

impl BinderMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let bind_attempts = register(
            &registry,
            counter_vec("bind_attempts_total", "Claim bind attempts", &["outcome"])?,
        )?;
        let conflicts = register(
            &registry,
            counter_vec("conflicts_total", "Optimistic write conflicts", &["kind"])?,
        )?;
        let phase_transitions = register(
            &registry,
            counter_vec(
                "phase_transitions_total",
                "Phase transitions written",
                &["kind", "phase"],
            )?,
        )?;
        let provisioning = register(
            &registry,
            counter_vec("provisioning_total", "Dynamic provisioning outcomes", &["outcome"])?,
        )?;
        let reclaims = register(
            &registry,
            counter_vec("reclaims_total", "Reclaim outcomes", &["policy", "outcome"])?,
        )?;
        let queue_depth = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("queue_depth", "Keys waiting in the work queue").namespace(NAMESPACE),
                &["queue"],
            )
            .map_err(|e| Error::Internal(format!("invalid metric queue_depth: {}", e)))?,
        )?;
        let reconcile_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("reconcile_duration_seconds", "Duration of reconcile passes")
                    .namespace(NAMESPACE),
                &["kind"],
            )
            .map_err(|e| Error::Internal(format!("invalid metric reconcile_duration: {}", e)))?,
        )?;
        let relists = register(
            &registry,
            IntCounter::with_opts(
                Opts::new("informer_relists_total", "Informer relists").namespace(NAMESPACE),
            )
            .map_err(|e| Error::Internal(format!("invalid metric relists: {}", e)))?,
        )?;

        Ok(Self {
            registry,
            bind_attempts,
            conflicts,
            phase_transitions,
            provisioning,
            reclaims,
            queue_depth,
            reconcile_duration,
            relists,
        })
    }

    /// Render in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

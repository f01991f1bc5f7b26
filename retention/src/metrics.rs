//! Prometheus metrics for the write-retention buffer.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::pending::NetEffect;

/// Labels for flush metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FlushLabels {
    pub kind: FlushKind,
    pub outcome: FlushOutcome,
}

/// Whether a flush stored changes or deleted the row.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FlushKind {
    Store,
    Delete,
}

impl From<&NetEffect> for FlushKind {
    fn from(effect: &NetEffect) -> Self {
        match effect {
            NetEffect::Store { .. } => FlushKind::Store,
            NetEffect::Delete { .. } => FlushKind::Delete,
        }
    }
}

/// Flush outcome label value.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum FlushOutcome {
    Ok,
    Error,
}

/// Container for all buffer metrics.
pub struct Metrics {
    registry: Registry,

    /// Counter of pending requests opened for a row.
    pub requests_created_total: Counter,

    /// Counter of mutations merged into a pending request.
    pub merges_total: Counter,

    /// Counter of merges retried because their request was sealed.
    pub sealed_retries_total: Counter,

    /// Counter of mutations sent straight to the backing store after shutdown.
    pub passthrough_writes_total: Counter,

    /// Counter of flushes sent to the backing store.
    pub flushes_total: Family<FlushLabels, Counter>,

    /// Number of flushes currently being sent.
    pub in_flight_flushes: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests_created_total = Counter::default();
        registry.register(
            "retention_requests_created_total",
            "Total number of pending requests opened",
            requests_created_total.clone(),
        );

        let merges_total = Counter::default();
        registry.register(
            "retention_merges_total",
            "Total number of mutations merged into pending requests",
            merges_total.clone(),
        );

        let sealed_retries_total = Counter::default();
        registry.register(
            "retention_sealed_retries_total",
            "Total number of merges retried against a new pending request",
            sealed_retries_total.clone(),
        );

        let passthrough_writes_total = Counter::default();
        registry.register(
            "retention_passthrough_writes_total",
            "Total number of mutations sent directly to the backing store",
            passthrough_writes_total.clone(),
        );

        let flushes_total = Family::<FlushLabels, Counter>::default();
        registry.register(
            "retention_flushes_total",
            "Total number of flushes sent to the backing store",
            flushes_total.clone(),
        );

        let in_flight_flushes = Gauge::default();
        registry.register(
            "retention_in_flight_flushes",
            "Number of flushes currently being sent",
            in_flight_flushes.clone(),
        );

        Self {
            registry,
            requests_created_total,
            merges_total,
            sealed_retries_total,
            passthrough_writes_total,
            flushes_total,
            in_flight_flushes,
        }
    }

    /// Records a completed flush.
    pub fn record_flush(&self, effect: &NetEffect, ok: bool) {
        let outcome = if ok {
            FlushOutcome::Ok
        } else {
            FlushOutcome::Error
        };
        self.flushes_total
            .get_or_create(&FlushLabels {
                kind: effect.into(),
                outcome,
            })
            .inc();
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics should not fail");
        buffer
    }
}

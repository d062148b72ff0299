//! Prometheus metrics for the secret service.
//!
//! Everything is registered in the global default registry on first use and
//! exposed as text on `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{opts, register_counter_vec, register_int_counter, CounterVec, Encoder, IntCounter, TextEncoder};

use crate::store::SweepReport;

/// How a retrieval attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalOutcome {
    Retrieved,
    InvalidId,
    InvalidPassword,
}

impl RetrievalOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalOutcome::Retrieved => "retrieved",
            RetrievalOutcome::InvalidId => "invalid_id",
            RetrievalOutcome::InvalidPassword => "invalid_password",
        }
    }
}

struct Metrics {
    secrets_created_total: CounterVec,
    retrievals_total: CounterVec,
    sweep_deleted_total: IntCounter,
    sweep_failed_total: IntCounter,
}

static METRICS: Lazy<Metrics> = Lazy::new(|| Metrics {
    secrets_created_total: register_counter_vec!(
        opts!("whisper_secrets_created_total", "Total number of secrets created"),
        &["one_time"]
    )
    .expect("failed to register whisper_secrets_created_total"),
    retrievals_total: register_counter_vec!(
        opts!("whisper_retrievals_total", "Retrieval attempts by outcome"),
        &["outcome"]
    )
    .expect("failed to register whisper_retrievals_total"),
    sweep_deleted_total: register_int_counter!(
        "whisper_sweep_deleted_total",
        "Secrets removed by the cleaner"
    )
    .expect("failed to register whisper_sweep_deleted_total"),
    sweep_failed_total: register_int_counter!(
        "whisper_sweep_failed_total",
        "Secrets the cleaner could not inspect or delete"
    )
    .expect("failed to register whisper_sweep_failed_total"),
});

pub fn record_created(one_time: bool) {
    let label = if one_time { "true" } else { "false" };
    METRICS
        .secrets_created_total
        .with_label_values(&[label])
        .inc();
}

pub fn record_retrieval(outcome: RetrievalOutcome) {
    METRICS
        .retrievals_total
        .with_label_values(&[outcome.as_str()])
        .inc();
}

pub fn record_sweep(report: &SweepReport) {
    METRICS.sweep_deleted_total.inc_by(report.deleted as u64);
    METRICS.sweep_failed_total.inc_by(report.failed as u64);
}

/// Encode all registered metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    Lazy::force(&METRICS);
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

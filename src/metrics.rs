// Prometheus metrics for admission control
//
// Exposed on the /metrics HTTP endpoint:
// - Admission decisions by outcome and kind (counter)
// - Fail-open / fail-closed events by error kind (counter)
// - Tracked counter keys (gauge, refreshed by the sweeper)
// - Evicted idle keys (counter)

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref ADMISSION_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("admission_decisions_total", "Admission decisions by outcome"),
        &["outcome", "kind"]
    ).expect("Failed to create admission decisions metric");

    pub static ref ADMISSION_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("admission_failures_total", "Checks that could not be completed"),
        &["kind", "policy"]
    ).expect("Failed to create admission failures metric");

    pub static ref ADMISSION_TRACKED_KEYS: IntGauge = IntGauge::new(
        "admission_tracked_keys",
        "Counter keys currently held by the store"
    ).expect("Failed to create tracked keys metric");

    pub static ref ADMISSION_EVICTED_KEYS_TOTAL: IntCounter = IntCounter::new(
        "admission_evicted_keys_total",
        "Idle counter keys removed by the sweeper"
    ).expect("Failed to create evicted keys metric");
}

/// Register all metrics; safe to call more than once
pub fn init() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ADMISSION_DECISIONS_TOTAL.clone()),
        Box::new(ADMISSION_FAILURES_TOTAL.clone()),
        Box::new(ADMISSION_TRACKED_KEYS.clone()),
        Box::new(ADMISSION_EVICTED_KEYS_TOTAL.clone()),
    ];
    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn record_decision(outcome: &str, kind: &str) {
    ADMISSION_DECISIONS_TOTAL
        .with_label_values(&[outcome, kind])
        .inc();
}

pub fn record_failure(kind: &str, policy: &str) {
    ADMISSION_FAILURES_TOTAL.with_label_values(&[kind, policy]).inc();
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

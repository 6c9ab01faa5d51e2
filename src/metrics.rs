use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};
use serde::Deserialize;

lazy_static! {
    pub static ref EPG_PASSES: IntCounterVec = register_int_counter_vec!(
        "dvbguide_epg_passes_total",
        "EPG aggregation passes by outcome (completed, failed, dropped)",
        &["outcome"]
    )
    .unwrap();
    pub static ref EPG_GRID_EVENTS: IntGauge = register_int_gauge!(
        "dvbguide_epg_grid_events",
        "Bucketed events in the most recently published grid"
    )
    .unwrap();
    pub static ref TUNE_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "dvbguide_tune_requests_total",
        "Channel change requests by outcome (tuned, no_route, failed)",
        &["outcome"]
    )
    .unwrap();
}

pub fn record_pass(outcome: &str) {
    EPG_PASSES.with_label_values(&[outcome]).inc();
}

pub fn record_tune(outcome: &str) {
    TUNE_REQUESTS.with_label_values(&[outcome]).inc();
}

pub fn gather_metrics() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitoring_enabled(),
        }
    }
}

fn default_monitoring_enabled() -> bool {
    true
}

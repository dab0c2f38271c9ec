use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder, reusing the global one when a second
/// component (or test) installs first.
pub fn init_metrics_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    builder
        .install_recorder()
        .unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle())
}

pub fn record_reconcile_outcome(outcome: &'static str) {
    counter!("genesis_reconcile_outcomes_total", "outcome" => outcome).increment(1);
}

pub fn record_authz_decision(allowed: bool) {
    let decision = if allowed { "allow" } else { "deny" };
    counter!("genesis_authz_decisions_total", "decision" => decision).increment(1);
}

pub fn record_event_delivery(outcome: &'static str) {
    counter!("genesis_event_deliveries_total", "outcome" => outcome).increment(1);
}

pub fn record_status_report(kind: &'static str) {
    counter!("genesis_status_reports_total", "kind" => kind).increment(1);
}

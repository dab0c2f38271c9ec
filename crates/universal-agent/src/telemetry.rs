use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::reconcile::TickReport;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

/// Install the Prometheus recorder, reusing the global one when an embedding
/// process (or test) installed first.
pub fn init_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle())
}

pub fn record_tick(report: &TickReport, elapsed: Duration) {
    counter!("genesis_ua_reconcile_created_total").increment(report.created as u64);
    counter!("genesis_ua_reconcile_updated_total").increment(report.updated as u64);
    counter!("genesis_ua_reconcile_deleted_total").increment(report.deleted as u64);
    counter!("genesis_ua_reconcile_errors_total").increment(report.errors as u64);
    counter!("genesis_ua_fetch_failures_total").increment(report.fetch_failures as u64);
    histogram!("genesis_ua_reconcile_tick_seconds").record(elapsed.as_secs_f64());
}

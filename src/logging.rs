// src/logging.rs
//
// Structured logging init, the same shape as the teacher's
// `tracing_setup`, minus the OpenTelemetry/Jaeger exporter pipeline (this
// crate has no tracing backend to ship spans to — see DESIGN.md).

use tracing::info;
use tracing_subscriber::EnvFilter;

pub fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt::fmt().with_env_filter(filter).init();

    info!("logging initialized at level={}", log_level);
}

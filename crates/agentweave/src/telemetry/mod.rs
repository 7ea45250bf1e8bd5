//! Metrics and span helpers.

pub mod metrics;
pub mod trace;

pub use metrics::Metrics;

use crate::config::LoggingSection;

/// Install the global tracing subscriber per the logging configuration.
/// Exporter wiring (OTLP etc.) is left to the embedding application.
pub fn init_logging(logging: &LoggingSection) {
	use tracing_subscriber::EnvFilter;

	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));
	let builder = tracing_subscriber::fmt().with_env_filter(filter);
	let result = if logging.format == "json" {
		builder.json().try_init()
	} else {
		builder.try_init()
	};
	if result.is_err() {
		tracing::debug!("tracing subscriber already installed");
	}
}

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber. The filter comes from
/// `RUST_LOG`, falling back to `info`.
pub fn setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.try_init();
}

/// Test-only subscriber setup; safe to call from every test.
pub fn testing_setup() {
	static ONCE: Once = Once::new();
	ONCE.call_once(|| {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
		let _ = tracing_subscriber::fmt()
			.with_env_filter(filter)
			.with_test_writer()
			.try_init();
	});
}

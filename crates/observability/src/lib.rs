//! Tracing/logging setup shared by every `fleetops` process.

/// Initialize process-wide tracing.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Initialize tracing for tests: human-readable output routed through the
/// libtest capture so it only shows for failing tests.
pub fn init_for_tests() {
    tracing::init_test();
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

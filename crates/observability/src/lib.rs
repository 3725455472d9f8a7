//! Process-wide tracing setup shared by binaries, tests and benches.

/// Initialize process-wide logging with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogConfig::default());
}

/// Logging setup for tests: human-readable, captured by the test harness.
pub fn init_for_tests() {
    tracing::init(&tracing::LogConfig::for_tests());
}

/// Tracing configuration (filters, formatting).
pub mod tracing;

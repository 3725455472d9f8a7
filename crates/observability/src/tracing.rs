//! Tracing/logging initialization.
//!
//! Filtering follows `RUST_LOG` when set (e.g. `RUST_LOG=courier_infra=debug`),
//! otherwise `LogConfig::default_filter`.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    Json,
    /// Compact human-readable lines written through the test harness capture.
    TestCompact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub default_filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    pub fn for_tests() -> Self {
        Self {
            default_filter: "courier_infra=debug,warn".to_string(),
            format: LogFormat::TestCompact,
        }
    }
}

fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_filter))
}

/// Install the global subscriber.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(config: &LogConfig) {
    let filter = filter(config);

    let _ = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::TestCompact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .with_test_writer()
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_no_op() {
        init(&LogConfig::for_tests());
        init(&LogConfig::default());
        ::tracing::info!(target: "courier_infra", "still logging");
    }
}

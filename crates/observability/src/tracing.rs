//! Tracing/logging initialization.
//!
//! JSON logs with timestamps by default, filtered by `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    /// Human-readable single-line output, for local runs.
    Compact,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Filter used when `RUST_LOG` is unset or invalid
    pub default_filter: String,
    pub format: LogFormat,
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
            with_target: false,
        }
    }
}

impl TracingConfig {
    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(&TracingConfig::default());
}

/// Initialize tracing/logging with an explicit configuration.
///
/// Returns whether this call installed the global subscriber.
pub fn init_with(config: &TracingConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(config.with_target);

    match config.format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Compact => builder.compact().try_init().is_ok(),
    }
}

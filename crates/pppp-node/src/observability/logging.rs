//! Structured logging initialization.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format (for development).
    Pretty,
    /// JSON format (for log aggregation).
    Json,
}

impl LogFormat {
    /// Parse log format from string. Anything but "json" is pretty.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Default filter directives for `level`, used when `RUST_LOG` is unset.
pub fn default_directives(level: &str) -> String {
    format!("pppp={level},pppp_p2p={level},pppp_storage={level},pppp_node={level}")
}

/// Initialize the logging system.
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// ```rust,no_run
/// use pppp_node::observability::{init_logging, LogFormat};
///
/// init_logging("info", LogFormat::Json);
/// ```
pub fn init_logging(level: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directives(level).into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }

    tracing::info!(level = %level, ?format, "logging initialized");
}

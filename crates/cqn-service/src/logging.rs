//! Structured logging for the query service
//!
//! Human-readable console output for development, JSON for production and
//! daily rotated log files. Levels are configurable per crate.

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE: &str = "cqn-service.log";

/// Crates whose events are kept at debug unless `RUST_LOG` says otherwise
const CRATES: &[&str] = &["cqn_service", "cqn_odata", "cqn_sql", "cqn_ql", "cqn_model"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format for development
    Pretty,
    /// JSON format for production
    Json,
    /// Compact format for testing
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }

    /// Parse from `LOG_FORMAT`, pretty when unset
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT").map(|v| Self::parse(&v)).unwrap_or(LogFormat::Pretty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File,
    Both,
}

impl LogOutput {
    pub fn parse(value: &str) -> Self {
        match value {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Stdout,
        }
    }

    /// Parse from `LOG_OUTPUT`, stdout when unset
    pub fn from_env() -> Self {
        std::env::var("LOG_OUTPUT").map(|v| Self::parse(&v)).unwrap_or(LogOutput::Stdout)
    }
}

fn env_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    CRATES.iter().fold(EnvFilter::new("info"), |filter, name| {
        match format!("{}=debug", name).parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        }
    })
}

/// Initialize the logging system from the environment
///
/// Environment variables:
/// - `RUST_LOG`: Log level (e.g., "debug", "info", "cqn_sql=trace")
/// - `LOG_FORMAT`: Output format ("pretty", "json", "compact")
/// - `LOG_OUTPUT`: Where to write logs ("stdout", "file", "both")
/// - `LOG_DIR`: Directory for log files (default: "./logs")
///
/// Call [`crate::Config::apply_logging_env`] first to log as configured.
pub fn init() {
    let format = LogFormat::from_env();
    let output = LogOutput::from_env();
    let env_filter = env_filter();
    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());

    match (output, format) {
        (LogOutput::Stdout, LogFormat::Pretty) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_target(true))
                .init();
        }
        (LogOutput::Stdout, LogFormat::Json) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_current_span(true))
                .init();
        }
        (LogOutput::Stdout, LogFormat::Compact) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .init();
        }
        (LogOutput::File, _) => {
            std::fs::create_dir_all(&log_dir).ok();
            let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE);

            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(file_appender).with_ansi(false))
                .init();
        }
        (LogOutput::Both, format) => {
            std::fs::create_dir_all(&log_dir).ok();
            let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE);

            let stdout_layer = match format {
                LogFormat::Pretty => fmt::layer().pretty().with_target(true).boxed(),
                LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
                LogFormat::Compact => fmt::layer().compact().boxed(),
            };
            let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false).boxed();

            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
        }
    }

    tracing::info!(format = ?format, output = ?output, "Logging initialized");
    if matches!(output, LogOutput::File | LogOutput::Both) {
        tracing::debug!(directory = %log_dir, file = LOG_FILE, "Writing log files");
    }
}

/// Emit a structured event with an `event` name and debug-formatted fields
///
/// Usage:
/// ```
/// cqn_service::log_event!(
///     level: tracing::Level::INFO,
///     event: "query_compiled",
///     kind: "SELECT",
///     placeholders: 2
/// );
/// ```
#[macro_export]
macro_rules! log_event {
    (level: $level:expr, event: $event:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::event!(
            $level,
            event = $event
            $(, $key = ?$value)*
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("json", LogFormat::Json ; "json")]
    #[test_case("compact", LogFormat::Compact ; "compact")]
    #[test_case("pretty", LogFormat::Pretty ; "pretty")]
    #[test_case("xml", LogFormat::Pretty ; "unknown falls back")]
    fn test_log_format_parse(value: &str, expected: LogFormat) {
        assert_eq!(LogFormat::parse(value), expected);
    }

    #[test_case("file", LogOutput::File ; "file")]
    #[test_case("both", LogOutput::Both ; "both")]
    #[test_case("stdout", LogOutput::Stdout ; "stdout")]
    #[test_case("", LogOutput::Stdout ; "empty falls back")]
    fn test_log_output_parse(value: &str, expected: LogOutput) {
        assert_eq!(LogOutput::parse(value), expected);
    }

    #[test]
    fn test_log_event_expands() {
        log_event!(level: tracing::Level::DEBUG, event: "test", rows: 3, kind: "SELECT");
    }
}

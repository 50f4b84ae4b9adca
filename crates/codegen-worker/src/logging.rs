//! Logger construction for the worker process.

use tracing::Dispatch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

use codegen_bridge::Logger;

/// Build the process logger from CODEGEN_LOG / RUST_LOG and LOG_FORMAT.
///
/// Output goes to stderr; stdout is left to the enclosing tool. The returned
/// logger is handed to the session explicitly and is not installed globally.
pub fn build_logger() -> Logger {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(std::env::var("CODEGEN_LOG").ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let dispatch = if use_json {
        Dispatch::new(
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr)),
        )
    } else {
        Dispatch::new(
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr)),
        )
    };

    Logger::new(dispatch)
}

fn default_directives(level: Option<&str>) -> String {
    let base_level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!(
        "codegen_worker={level},codegen_bridge={level},codegen_bridge::bridge::codec=off",
        level = base_level
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_is_info() {
        assert_eq!(
            default_directives(None),
            "codegen_worker=info,codegen_bridge=info,codegen_bridge::bridge::codec=off"
        );
    }

    #[test]
    fn warning_is_an_alias_for_warn() {
        assert!(default_directives(Some("warning")).starts_with("codegen_worker=warn,"));
        assert!(default_directives(Some("bogus")).starts_with("codegen_worker=info,"));
    }
}

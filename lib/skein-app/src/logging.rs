//! Logging.

use skein_error::{ErrorContext as _, GenericError};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer as _};

const LOG_LEVEL_VAR: &str = "SKEIN_LOG_LEVEL";
const LOG_FORMAT_JSON_VAR: &str = "SKEIN_LOG_FORMAT_JSON";

/// Initializes the logging subsystem for `tracing`.
///
/// This function reads the `SKEIN_LOG_LEVEL` environment variable to determine the filtering directives to use. If the
/// environment variable is not set, `default_level` is used, or `INFO` if no default level is given. Additionally, it
/// reads the `SKEIN_LOG_FORMAT_JSON` environment variable to determine which output format to use: if it is set to
/// `true` or `1`, logs are formatted as JSON. Otherwise, logs default to a human-readable format.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<(), GenericError> {
    let is_json = is_json_format(std::env::var(LOG_FORMAT_JSON_VAR).ok().as_deref());

    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var(LOG_LEVEL_VAR)
        .from_env_lossy();

    if is_json {
        let json_layer = tracing_subscriber::fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true);
        tracing_subscriber::registry()
            .with(json_layer.with_filter(level_filter))
            .try_init()
            .error_context("Failed to install the JSON logging subscriber.")?;
    } else {
        let pretty_layer = tracing_subscriber::fmt::Layer::new()
            .with_target(true)
            .with_thread_names(true);
        tracing_subscriber::registry()
            .with(pretty_layer.with_filter(level_filter))
            .try_init()
            .error_context("Failed to install the logging subscriber.")?;
    }

    Ok(())
}

fn is_json_format(value: Option<&str>) -> bool {
    value
        .map(|s| s.trim().to_lowercase())
        .is_some_and(|s| s == "true" || s == "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_format_detection() {
        assert!(is_json_format(Some("true")));
        assert!(is_json_format(Some(" TRUE ")));
        assert!(is_json_format(Some("1")));
        assert!(!is_json_format(Some("json")));
        assert!(!is_json_format(Some("0")));
        assert!(!is_json_format(None));
    }

    #[test]
    fn second_initialization_fails() {
        initialize_logging(Some(LevelFilter::WARN)).expect("first initialization should succeed");
        tracing::warn!("Logging initialized.");
        assert!(initialize_logging(None).is_err());
    }
}

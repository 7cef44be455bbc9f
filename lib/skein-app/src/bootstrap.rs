//! Bootstrap utilities.

use std::path::Path;

use skein_config::ConfigurationLoader;
use skein_core::{RuntimeConfiguration, Scheduler};
use skein_error::{ErrorContext as _, GenericError};
use tracing::{info, warn};

/// Prefix of the environment variables that override the runtime configuration.
pub const ENVIRONMENT_PREFIX: &str = "SKEIN";

/// Loads the runtime configuration.
///
/// Sources are layered, later ones overriding earlier ones: the defaults of [`RuntimeConfiguration`], then the file at
/// `path` if one is given (JSON when its extension is `.json`, YAML otherwise), then `SKEIN_`-prefixed environment
/// variables (for example, `SKEIN_MAX_THREADS=8`).
///
/// # Errors
///
/// If the file cannot be read or parsed, or if a value has the wrong type, an error will be returned.
pub fn load_runtime_configuration(path: Option<&Path>) -> Result<RuntimeConfiguration, GenericError> {
    let mut loader = ConfigurationLoader::default().with_defaults(RuntimeConfiguration::default());
    if let Some(path) = path {
        loader = loader
            .from_file(path)
            .with_error_context(|| format!("Failed to load configuration file '{}'.", path.display()))?;
    }

    let config: RuntimeConfiguration = loader
        .from_environment(ENVIRONMENT_PREFIX)
        .error_context("Failed to read configuration from the environment.")?
        .into_typed()
        .error_context("Failed to parse runtime configuration.")?;

    if config.min_threads > config.max_threads {
        warn!(
            min_threads = config.min_threads,
            max_threads = config.max_threads,
            "Minimum thread count exceeds the maximum. The pool will grow up to the minimum."
        );
    }

    Ok(config)
}

/// Creates a scheduler from `config`, starts it, and installs it as the process-wide default.
///
/// The previous default scheduler stops accepting work once every handle to it has been dropped.
///
/// # Errors
///
/// If the initial pool threads cannot be spawned, an error will be returned and the default scheduler is left
/// unchanged.
pub fn install_default_scheduler(config: RuntimeConfiguration) -> Result<Scheduler, GenericError> {
    let scheduler = Scheduler::new(config);
    scheduler
        .start()
        .error_context("Failed to start the default scheduler.")?;

    let previous = Scheduler::set_global(scheduler.clone());
    info!(
        scheduler = scheduler.id(),
        previous = previous.id(),
        min_threads = scheduler.config().min_threads,
        max_threads = scheduler.config().max_threads,
        "Installed default scheduler."
    );

    Ok(scheduler)
}

//! Layered configuration loading for skein embedders.
//!
//! A [`ConfigurationLoader`] stacks sources on top of each other: serialized defaults at the bottom, then
//! configuration files, then prefixed environment variables. Each source is read as soon as it is added, and the
//! merged result is extracted into a typed value at the end.
#![deny(warnings)]
#![deny(missing_docs)]

use std::path::Path;

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use skein_error::GenericError;
use snafu::Snafu;
use tracing::debug;

mod provider;
use self::provider::{FileFormat, FileSnapshot};

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A required field had no value in any source.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Name of the missing field.
        field: String,

        /// Where the field can be set, including its environment variable spelling when environment variables were
        /// loaded.
        help_text: String,
    },

    /// A field had a value of the wrong data type.
    #[snafu(display("Expected value for field '{}' to be '{}', got '{}' instead.", field, expected_ty, actual_ty))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Any other failure while reading a source or extracting the configuration.
    #[snafu(display("Failed to load configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

/// Builds a configuration out of layered sources.
///
/// Sources added later take precedence over sources added earlier, except for
/// [`with_defaults`][Self::with_defaults], which always sits underneath everything else.
pub struct ConfigurationLoader {
    figment: Figment,
    env_prefix: Option<String>,
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self {
            figment: Figment::new(),
            env_prefix: None,
        }
    }
}

impl ConfigurationLoader {
    /// Uses the given value as the fallback for every field no other source sets.
    pub fn with_defaults<T>(mut self, defaults: T) -> Self
    where
        T: Serialize,
    {
        self.figment = self.figment.join(Serialized::defaults(defaults));
        self
    }

    /// Loads a configuration file.
    ///
    /// Files ending in `.json` are parsed as JSON, anything else as YAML.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or parsed, an error will be returned.
    pub fn from_file<P>(self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        self.from_file_as(path, FileFormat::from_path(path))
    }

    fn from_file_as(mut self, path: &Path, format: FileFormat) -> Result<Self, ConfigurationError> {
        let snapshot = FileSnapshot::read(path, format).map_err(|e| ConfigurationError::Generic { source: e.into() })?;
        debug!(path = %path.display(), ?format, "Loaded configuration file.");
        self.figment = self.figment.admerge(snapshot);
        Ok(self)
    }

    /// Loads environment variables starting with `prefix`.
    ///
    /// The prefix is matched case-insensitively, and an underscore separates it from the key: with a prefix of
    /// `skein`, `SKEIN_MAX_THREADS` sets `max_threads`.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        let prefix = prefix.trim_end_matches('_');
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = format!("{}_", prefix.to_uppercase());
        self.figment = self.figment.admerge(Env::prefixed(&prefix));
        self.env_prefix = Some(prefix);
        Ok(self)
    }

    /// Extracts the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If a field `T` requires is missing, or a value has the wrong type, an error will be returned.
    pub fn into_typed<T>(self) -> Result<T, ConfigurationError>
    where
        T: DeserializeOwned,
    {
        self.figment.extract().map_err(|e| self.explain(e))
    }

    fn explain(&self, e: figment::Error) -> ConfigurationError {
        match e.kind {
            Kind::MissingField(field) => {
                let help_text = match &self.env_prefix {
                    Some(prefix) => format!(
                        "Set it in a configuration file, or through the `{}{}` environment variable.",
                        prefix,
                        field.replace('.', "_").to_uppercase()
                    ),
                    None => "Set it in a configuration file.".to_string(),
                };
                ConfigurationError::MissingField {
                    field: field.into_owned(),
                    help_text,
                }
            }
            Kind::InvalidType(actual, expected) => ConfigurationError::InvalidFieldType {
                field: e.path.join("."),
                expected_ty: expected,
                actual_ty: actual.to_string(),
            },
            _ => ConfigurationError::Generic { source: e.into() },
        }
    }
}

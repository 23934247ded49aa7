//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An
//! example configuration file can be found in the `configs/` directory located in the repository
//! root.

use std::{collections::HashSet, fmt, path::Path};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use raccoon_core::{init::DEFAULT_HIDDEN_LAYERS, DenseInitializer};

#[cfg(test)]
mod tests;

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_groups"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub api: ApiSettings,
    pub log: LoggingSettings,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[validate]
    #[serde(default)]
    pub client: ClientSettings,
    /// The training groups, each with its own global model.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [[groups]]
    /// name = "income"
    /// input_dim = 14
    /// output_dim = 2
    ///
    /// [[groups]]
    /// name = "credit"
    /// input_dim = 23
    /// output_dim = 3
    /// ```
    #[validate(length(min = 1))]
    pub groups: Vec<GroupSettings>,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("raccoon").separator("__"))?;
        config.try_into()
    }
}

/// Checks that the group names are non-empty and unique and that the dimensions are positive.
fn validate_groups(settings: &Settings) -> Result<(), ValidationError> {
    let mut names = HashSet::new();
    for group in settings.groups.iter() {
        if group.name.trim().is_empty() {
            return Err(ValidationError::new("empty group name"));
        }
        if !names.insert(group.name.as_str()) {
            return Err(ValidationError::new("duplicate group name"));
        }
        if group.input_dim == 0 || group.output_dim == 0 {
            return Err(ValidationError::new("invalid group dimensions"));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize, Clone)]
/// REST API settings.
pub struct ApiSettings {
    /// The address to which the REST API should be bound.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [api]
    /// bind_address = "0.0.0.0:5000"
    /// # or
    /// bind_address = "127.0.0.1:5000"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// RACCOON_API__BIND_ADDRESS=127.0.0.1:5000
    /// ```
    pub bind_address: std::net::SocketAddr,
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Coordinator settings.
pub struct CoordinatorSettings {
    /// Whether deltas holding NaN or infinite scalars are rejected on submission. When disabled,
    /// such deltas are accepted and propagate into the aggregated weights.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [coordinator]
    /// reject_non_finite = true
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// RACCOON_COORDINATOR__REJECT_NON_FINITE=true
    /// ```
    #[serde(default = "default_reject_non_finite")]
    pub reject_non_finite: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            reject_non_finite: default_reject_non_finite(),
        }
    }
}

fn default_reject_non_finite() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
/// Model initialization settings.
pub struct ModelSettings {
    /// The widths of the hidden layers of the initial models.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// hidden = [64, 32]
    /// ```
    #[serde(default = "default_hidden")]
    pub hidden: Vec<usize>,

    /// The seed of the initial weights. Leave this out to draw them from system entropy.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model]
    /// seed = 42
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// RACCOON_MODEL__SEED=42
    /// ```
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            hidden: default_hidden(),
            seed: None,
        }
    }
}

fn default_hidden() -> Vec<usize> {
    DEFAULT_HIDDEN_LAYERS.to_vec()
}

impl From<&ModelSettings> for DenseInitializer {
    fn from(settings: &ModelSettings) -> Self {
        DenseInitializer::new(settings.hidden.clone(), settings.seed)
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy, PartialEq)]
#[validate(schema(function = "validate_noise_std"))]
/// Settings of the simulated clients.
pub struct ClientSettings {
    /// The standard deviation of the Gaussian noise added to every delta. `0` disables the
    /// perturbation. Must be finite.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [client]
    /// noise_std = 0.01
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// RACCOON_CLIENT__NOISE_STD=0.01
    /// ```
    #[validate(range(min = 0.0))]
    #[serde(default = "default_noise_std")]
    pub noise_std: f32,

    /// The time to wait before retrying a submission rejected because the round was busy, in
    /// milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// The maximal number of retries of a rejected submission.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            noise_std: default_noise_std(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retries: default_max_retries(),
        }
    }
}

fn validate_noise_std(settings: &ClientSettings) -> Result<(), ValidationError> {
    if !settings.noise_std.is_finite() {
        return Err(ValidationError::new("non-finite noise std"));
    }
    Ok(())
}

fn default_noise_std() -> f32 {
    0.01
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    10
}

#[derive(Debug, Deserialize, serde::Serialize, Clone, PartialEq, Eq)]
/// A training group.
pub struct GroupSettings {
    /// The unique name of the group.
    pub name: String,
    /// The number of input features of the group's model.
    pub input_dim: usize,
    /// The number of output classes of the group's model.
    pub output_dim: usize,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// RACCOON_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

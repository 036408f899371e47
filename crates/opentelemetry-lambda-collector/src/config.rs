//! Extension configuration.
//!
//! Layered with figment, later sources overriding earlier ones:
//! 1. Default values (compiled in)
//! 2. Config file: `/opt/otel-lambda-collector.toml` (optional)
//! 3. Standard Lambda and collector environment variables
//! 4. Extension-specific environment variables (`OTEL_LAMBDA_*`)
//!
//! # Standard Environment Variables
//!
//! | Variable | Config Path | Description |
//! |----------|-------------|-------------|
//! | `AWS_LAMBDA_RUNTIME_API` | `runtime_api` | Host and port of the Runtime API |
//! | `OPENTELEMETRY_COLLECTOR_CONFIG_FILE` | `collector.config_uris` | Single collector config URI |
//!
//! Extension-specific variables use `__` between path segments, for example
//! `OTEL_LAMBDA_TELEMETRY_API__TIMEOUT=2000`.

use crate::telemetry::TelemetryType;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/opt/otel-lambda-collector.toml";
const ENV_PREFIX: &str = "OTEL_LAMBDA_";

/// Extension name used when the executable path cannot be determined.
pub const FALLBACK_EXTENSION_NAME: &str = "otel-lambda-collector";

/// Collector configuration used when no override is set.
pub const DEFAULT_COLLECTOR_CONFIG_URI: &str = "/opt/collector-config/config.yaml";

/// Environment variable overriding the collector configuration URIs.
pub const COLLECTOR_CONFIG_ENV: &str = "OPENTELEMETRY_COLLECTOR_CONFIG_FILE";

/// Environment variable Lambda sets to the Runtime API address.
pub const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";

/// Main configuration struct for the extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Extension registration settings.
    pub extension: ExtensionConfig,
    /// Runtime API address (`host:port`), normally from `AWS_LAMBDA_RUNTIME_API`.
    pub runtime_api: Option<String>,
    /// Collector lifecycle settings.
    pub collector: CollectorConfig,
    /// Telemetry API subscription settings.
    pub telemetry_api: TelemetryApiConfig,
}

impl Config {
    /// Loads configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration using a custom config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        figment = figment.merge(standard_env());
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract()
    }

    /// Creates a new config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Base URL of the Runtime API, with an `http://` scheme added when the
    /// configured address has none.
    pub fn runtime_api_url(&self) -> Option<String> {
        self.runtime_api.as_deref().map(runtime_api_url)
    }
}

/// Normalises a Runtime API address into a base URL.
pub fn runtime_api_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// Extension registration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    /// Name sent in `Lambda-Extension-Name`. Must match the executable name
    /// under `/opt/extensions`; defaults to the running executable's file name.
    pub name: String,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        let name = std::env::current_exe()
            .ok()
            .as_deref()
            .and_then(executable_name)
            .unwrap_or_else(|| FALLBACK_EXTENSION_NAME.to_string());
        Self { name }
    }
}

fn executable_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

/// Collector lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Ordered configuration source URIs; later sources override earlier ones.
    pub config_uris: Vec<String>,
    /// Maximum time to wait for the collector to report it is running, in
    /// milliseconds.
    #[serde(with = "duration_ms")]
    pub startup_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            config_uris: vec![DEFAULT_COLLECTOR_CONFIG_URI.to_string()],
            startup_timeout: Duration::from_secs(10),
        }
    }
}

/// Telemetry API subscription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryApiConfig {
    /// Whether to subscribe to the Telemetry API at all.
    pub enabled: bool,
    /// Telemetry categories to subscribe to.
    pub types: Vec<TelemetryType>,
    /// Request timeout in milliseconds.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Whether a failed subscription aborts the extension.
    pub required: bool,
}

impl Default for TelemetryApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            types: TelemetryType::defaults(),
            timeout: Duration::from_millis(1000),
            required: false,
        }
    }
}

/// Builder for constructing configuration programmatically.
#[must_use = "builders do nothing unless .build() is called"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new config builder with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Sets the extension name.
    pub fn extension_name(mut self, name: impl Into<String>) -> Self {
        self.config.extension.name = name.into();
        self
    }

    /// Sets the Runtime API address.
    pub fn runtime_api(mut self, address: impl Into<String>) -> Self {
        self.config.runtime_api = Some(address.into());
        self
    }

    /// Replaces the collector configuration URIs.
    pub fn config_uris<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.collector.config_uris = uris.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the collector startup timeout.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.collector.startup_timeout = timeout;
        self
    }

    /// Enables or disables the Telemetry API subscription.
    pub fn telemetry_api(mut self, enabled: bool) -> Self {
        self.config.telemetry_api.enabled = enabled;
        self
    }

    /// Sets the telemetry types to subscribe to.
    pub fn telemetry_types(mut self, types: Vec<TelemetryType>) -> Self {
        self.config.telemetry_api.types = types;
        self
    }

    /// Sets whether a failed subscription is fatal.
    pub fn telemetry_required(mut self, required: bool) -> Self {
        self.config.telemetry_api.required = required;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Serialize)]
struct PartialCollectorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    config_uris: Option<Vec<String>>,
}

#[derive(Debug, Default, Serialize)]
struct PartialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_api: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    collector: Option<PartialCollectorConfig>,
}

fn standard_env() -> Serialized<PartialConfig> {
    let mut config = PartialConfig::default();

    if let Ok(address) = std::env::var(RUNTIME_API_ENV)
        && !address.is_empty()
    {
        config.runtime_api = Some(address);
    }

    if let Ok(value) = std::env::var(COLLECTOR_CONFIG_ENV) {
        let uri = value.trim();
        if !uri.is_empty() {
            tracing::info!(%uri, "Using collector config URI from environment");
            config.collector = Some(PartialCollectorConfig {
                config_uris: Some(vec![uri.to_string()]),
            });
        }
    }

    Serialized::defaults(config)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tally_export::{ClientOptions, ExporterConfig, ExternalLabels, ReloadConfig};
use tally_log::LogConfig;
use tally_statsd::MetricsClientConfig;

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override or a validated field.
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => write!(f, " (file {})", file_name.display()),
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Box::new(cause)),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn for_field<E>(cause: E, field: &str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// The format of a configuration file, derived from its extension.
enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Invalid value in an environment override.
#[derive(Debug, thiserror::Error)]
#[error("expected a boolean, got {0:?}")]
struct InvalidBool(String);

fn parse_bool(value: &str) -> Result<bool, InvalidBool> {
    match value.to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        _ => Err(InvalidBool(value.to_owned())),
    }
}

/// Configuration overrides from environment variables or command line parameters.
///
/// Identity labels set here become defaults for the external labels. Explicit external labels
/// in the configuration file or a reload still take precedence.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The default project, read from `TALLY_PROJECT_ID`.
    pub project_id: Option<String>,
    /// The default location, read from `TALLY_LOCATION`.
    pub location: Option<String>,
    /// The default cluster, read from `TALLY_CLUSTER`.
    pub cluster: Option<String>,
    /// `"true"` to disable exporting, read from `TALLY_EXPORT_DISABLED`.
    pub export_disabled: Option<String>,
}

impl OverridableConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Reads overrides through the given variable lookup.
    pub fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            project_id: var("TALLY_PROJECT_ID"),
            location: var("TALLY_LOCATION"),
            cluster: var("TALLY_CLUSTER"),
            export_disabled: var("TALLY_EXPORT_DISABLED"),
        }
    }
}

/// Controls internal metrics.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables internal metrics.
    pub statsd: Option<String>,
    /// Common prefix that should be added to all metrics.
    ///
    /// Defaults to `"tally"`.
    pub prefix: String,
    /// Default tags to apply to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Emitted metrics will be buffered to optimize performance.
    ///
    /// Defaults to `true`.
    pub buffering: bool,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    ///
    /// Defaults to `1.0` (100%).
    pub sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "tally".to_owned(),
            default_tags: BTreeMap::new(),
            buffering: true,
            sample_rate: 1.0,
        }
    }
}

/// The raw values of a configuration file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigValues {
    /// Logging setup.
    pub logging: LogConfig,
    /// Internal metrics.
    pub metrics: Metrics,
    /// Exporter settings.
    pub exporter: ExporterConfig,
    /// External labels applied to every exported series.
    pub labels: ExternalLabels,
    /// Options of the remote client.
    pub client: ClientOptions,
}

/// Exporter process configuration.
#[derive(Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a YAML or JSON file.
    ///
    /// Files with a `.json` extension are parsed as JSON, everything else as YAML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(path))?;

        let values = match ConfigFormat::from_path(path) {
            ConfigFormat::Yaml => serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(path))?,
            ConfigFormat::Json => serde_json::from_str(&contents)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson).file(path))?,
        };

        let config = Self::from_values(values, path.to_path_buf())?;
        tally_log::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Creates a config from a YAML string.
    ///
    /// An empty document yields the default configuration.
    pub fn from_yaml(yaml: &str) -> Result<Config, ConfigError> {
        let values = match yaml.trim() {
            "" => ConfigValues::default(),
            _ => serde_yaml::from_str(yaml)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))?,
        };

        Self::from_values(values, PathBuf::new())
    }

    fn from_values(values: ConfigValues, path: PathBuf) -> Result<Config, ConfigError> {
        values.exporter.validate().map_err(|e| {
            let field = format!("exporter.{}", e.0);
            ConfigError::for_field(e, &field)
        })?;

        Ok(Config { values, path })
    }

    /// Overrides configuration with values from other sources, such as environment variables.
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let exporter = &mut self.values.exporter;

        if let Some(disabled) = overrides.export_disabled {
            exporter.disabled = parse_bool(&disabled)
                .map_err(|e| ConfigError::for_field(e, "export_disabled"))?;
        }

        let defaults = &mut exporter.label_defaults;
        if let Some(project_id) = overrides.project_id {
            defaults.project_id = project_id;
        }
        if let Some(location) = overrides.location {
            defaults.location = location;
        }
        if let Some(cluster) = overrides.cluster {
            defaults.cluster = cluster;
        }

        Ok(self)
    }

    /// Returns the path of the loaded file, empty if not loaded from a file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the raw configuration values.
    pub fn values(&self) -> &ConfigValues {
        &self.values
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the exporter settings.
    pub fn exporter(&self) -> &ExporterConfig {
        &self.values.exporter
    }

    /// Returns the statsd client configuration, if a statsd server is configured.
    pub fn metrics_client_config(&self) -> Option<MetricsClientConfig<'_, &str>> {
        let metrics = &self.values.metrics;
        let host = metrics.statsd.as_deref()?;

        Some(MetricsClientConfig {
            prefix: &metrics.prefix,
            host,
            default_tags: metrics.default_tags.clone(),
            default_sample_rate: metrics.sample_rate.into(),
            buffered: metrics.buffering,
        })
    }

    /// Builds the runtime configuration applied to the exporter.
    ///
    /// `extra_labels` are merged over the configured labels, for example the global external
    /// labels of the scrape configuration.
    pub fn reload_request(&self, extra_labels: &ExternalLabels) -> ReloadConfig {
        let mut external_labels = self.values.labels.clone();
        for (name, value) in extra_labels.iter() {
            external_labels.insert(name, value);
        }

        ReloadConfig {
            external_labels,
            client: self.values.client.clone(),
        }
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ClientOptions;
use crate::labels::ExternalLabels;

/// Identity labels used when a reload does not provide them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExternalLabelDefaults {
    /// Default tenant (`project_id` label).
    pub project_id: String,
    /// Default location (`location` label).
    pub location: String,
    /// Default cluster (`cluster` label).
    pub cluster: String,
}

/// Parameters used by the [`Exporter`](crate::Exporter).
///
/// The shard layout is fixed for the lifetime of an exporter. All other parameters are read when
/// the exporter is created.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Disables exporting at startup.
    ///
    /// While disabled, export calls return immediately. Can be toggled at runtime.
    pub disabled: bool,

    /// Number of shards series are partitioned into.
    ///
    /// Every shard has at most one batch in flight. More shards allow more parallel sends, but
    /// also produce smaller batches under low load. Defaults to `1024`.
    pub shard_count: usize,

    /// Number of samples buffered per shard.
    ///
    /// When a shard's buffer is full, new samples for that shard are dropped. Defaults to `2048`.
    pub shard_buffer_size: usize,

    /// Maximum number of series sent per tenant in a single request.
    ///
    /// A batch is sent as soon as one tenant reaches this size. Defaults to `200`.
    pub max_batch_size: usize,

    /// Maximum time in milliseconds a non-empty batch waits before it is sent.
    ///
    /// Defaults to `50` milliseconds.
    pub batch_delay_ms: u64,

    /// Timeout in seconds for a single remote write.
    ///
    /// Defaults to `30` seconds.
    pub send_timeout_secs: u64,

    /// Maximum time in seconds spent sending buffered samples on shutdown.
    ///
    /// Samples still buffered afterwards are dropped. Defaults to `15` seconds.
    pub drain_timeout_secs: u64,

    /// Time in milliseconds to wait after the last batch has completed on shutdown.
    ///
    /// Defaults to `100` milliseconds.
    pub drain_grace_ms: u64,

    /// Interval in milliseconds between drain passes on shutdown.
    ///
    /// Defaults to `50` milliseconds.
    pub drain_poll_ms: u64,

    /// Identity labels applied when the reloaded external labels do not set them.
    pub label_defaults: ExternalLabelDefaults,
}

impl ExporterConfig {
    /// Returns the maximum delay before a non-empty batch is sent.
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Returns the timeout of a single remote write.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Returns the maximum duration of the shutdown drain.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Returns the grace period after the drain completed.
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Returns the interval between drain passes.
    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }

    /// Rejects settings the exporter cannot run with.
    pub fn validate(&self) -> Result<(), InvalidSetting> {
        let settings = [
            ("shard_count", self.shard_count as u64),
            ("shard_buffer_size", self.shard_buffer_size as u64),
            ("max_batch_size", self.max_batch_size as u64),
            ("batch_delay_ms", self.batch_delay_ms),
            ("send_timeout_secs", self.send_timeout_secs),
            ("drain_poll_ms", self.drain_poll_ms),
        ];

        match settings.into_iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(InvalidSetting(name)),
            None => Ok(()),
        }
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            shard_count: 1024,
            shard_buffer_size: 2048,
            max_batch_size: 200,
            batch_delay_ms: 50,
            send_timeout_secs: 30,
            drain_timeout_secs: 15,
            drain_grace_ms: 100,
            drain_poll_ms: 50,
            label_defaults: ExternalLabelDefaults::default(),
        }
    }
}

/// An exporter setting that must be greater than zero is zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("exporter setting {0:?} must be greater than zero")]
pub struct InvalidSetting(pub &'static str);

/// The part of the configuration that can change at runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// External labels from the reloaded configuration.
    ///
    /// Missing identity labels are filled from [`ExporterConfig::label_defaults`].
    pub external_labels: ExternalLabels,
    /// Options of the remote client.
    pub client: ClientOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        insta::assert_debug_snapshot!(ExporterConfig::default(), @r#"
        ExporterConfig {
            disabled: false,
            shard_count: 1024,
            shard_buffer_size: 2048,
            max_batch_size: 200,
            batch_delay_ms: 50,
            send_timeout_secs: 30,
            drain_timeout_secs: 15,
            drain_grace_ms: 100,
            drain_poll_ms: 50,
            label_defaults: ExternalLabelDefaults {
                project_id: "",
                location: "",
                cluster: "",
            },
        }
        "#);
    }

    #[test]
    fn test_parse_partial_config() {
        let config: ExporterConfig = serde_yaml::from_str(
            r#"
shard_count: 16
max_batch_size: 10
label_defaults:
  project_id: my-project
"#,
        )
        .unwrap();

        assert_eq!(config.shard_count, 16);
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.shard_buffer_size, 2048);
        assert_eq!(config.label_defaults.project_id, "my-project");
        assert_eq!(config.batch_delay(), Duration::from_millis(50));
        assert_eq!(config.send_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_validate() {
        assert_eq!(ExporterConfig::default().validate(), Ok(()));

        let config = ExporterConfig {
            shard_buffer_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(InvalidSetting("shard_buffer_size")));
        assert_eq!(
            InvalidSetting("shard_count").to_string(),
            "exporter setting \"shard_count\" must be greater than zero"
        );
    }
}

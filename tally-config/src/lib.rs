//! Configuration for the tally sample exporter.
//!
//! The configuration is loaded from a single YAML or JSON file with [`Config::from_path`]. All
//! sections are optional and fall back to documented defaults. Identity labels and the export
//! switch can additionally be overridden through environment variables, see
//! [`OverridableConfig`].
//!
//! ```yaml
//! logging:
//!   level: debug
//! metrics:
//!   statsd: 127.0.0.1:8125
//! exporter:
//!   shard_count: 512
//!   label_defaults:
//!     location: europe-west1
//! labels:
//!   project_id: my-project
//!   cluster: prod
//! client:
//!   endpoint: https://monitoring.example.com
//! ```
#![warn(missing_docs)]

mod config;

pub use self::config::*;

//! Input and output types of the sample conversion layer.
//!
//! The exporter does not convert samples itself. A [`SampleBuilder`] turns raw samples into
//! [`HashedSeries`], each carrying a stable hash of the series identity and an already encoded
//! [`TimeSeries`] payload. The exporter only reads the payload's [`Tenant`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::labels::ExternalLabels;

/// Identifies the tenant (the backend project) a series is written to.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tenant(Arc<str>);

impl Tenant {
    /// Creates a tenant from its identifier.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the tenant identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tenant({:?})", self.as_str())
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Tenant {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Tenant {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A backend-native time series payload.
///
/// The body is encoded by the conversion layer and passed through to the remote client as is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeSeries {
    /// The tenant this series is written to.
    pub tenant: Tenant,
    /// The encoded series, including its single point.
    pub body: Bytes,
}

/// A converted series together with the hash of its identity.
///
/// Two entries with the same hash describe the same series and must never be in flight
/// concurrently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashedSeries {
    /// Stable digest of the series' label set.
    pub hash: u64,
    /// The payload to send.
    pub series: TimeSeries,
}

/// A raw sample produced by a scrape or rule evaluation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// Reference to the series in the producer's series storage.
    pub series_ref: u64,
    /// Sample timestamp in milliseconds since the UNIX epoch.
    pub timestamp: i64,
    /// The sample value.
    pub value: f64,
}

/// An exemplar attached to a sample, keyed by its series reference in [`Exemplars`].
#[derive(Clone, Debug, PartialEq)]
pub struct Exemplar {
    /// Labels of the exemplar, such as a trace identifier.
    pub labels: BTreeMap<String, String>,
    /// The exemplar value.
    pub value: f64,
    /// Exemplar timestamp in milliseconds since the UNIX epoch.
    pub timestamp: i64,
}

/// Exemplars of one export call by series reference.
pub type Exemplars = HashMap<u64, Exemplar>;

/// The kind of a metric family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// A monotonic counter.
    Counter,
    /// A gauge.
    Gauge,
    /// A histogram with buckets.
    Histogram,
    /// A summary with quantiles.
    Summary,
    /// Untyped or unknown.
    Unknown,
}

/// Metadata of a metric family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    /// The metric family name.
    pub metric: String,
    /// The metric kind.
    pub kind: MetricKind,
    /// The help text.
    pub help: String,
    /// The unit, if known.
    pub unit: String,
}

/// Looks up metadata of metric families during conversion.
pub trait MetadataSource: Send + Sync {
    /// Returns metadata for the given metric family.
    fn get(&self, metric: &str) -> Option<Metadata>;
}

impl<F> MetadataSource for F
where
    F: Fn(&str) -> Option<Metadata> + Send + Sync,
{
    fn get(&self, metric: &str) -> Option<Metadata> {
        self(metric)
    }
}

/// Errors returned by a [`SampleBuilder`].
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// The referenced series is not known to the series cache.
    #[error("unknown series reference {0}")]
    UnknownSeries(u64),
    /// The metric family has no metadata.
    #[error("no metadata for metric {0:?}")]
    MissingMetadata(String),
    /// The series or sample cannot be represented by the backend.
    #[error("invalid series: {0}")]
    Invalid(String),
}

/// Converts raw samples into hashed backend payloads.
///
/// Implementations typically cache converted series and must drop or refresh that cache when
/// asked to, since cached series carry the external labels that were active at conversion time.
pub trait SampleBuilder: Send + Sync {
    /// Converts a prefix of `samples`.
    ///
    /// Returns the converted series and the samples that have not been consumed yet. The
    /// exporter calls this repeatedly until no samples remain.
    fn convert<'s>(
        &self,
        metadata: &dyn MetadataSource,
        external_labels: &ExternalLabels,
        samples: &'s [Sample],
        exemplars: &Exemplars,
    ) -> Result<(Vec<HashedSeries>, &'s [Sample]), ConvertError>;

    /// Marks all cached series as stale, so they are re-converted on next use.
    fn force_refresh(&self);

    /// Drops all cached series.
    fn clear(&self);
}

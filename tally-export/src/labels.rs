//! External labels attached to every exported series.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ExternalLabelDefaults;
use crate::series::Tenant;

/// Label holding the tenant (backend project) of a series.
pub const PROJECT_ID: &str = "project_id";
/// Label holding the location (region or zone) of a series.
pub const LOCATION: &str = "location";
/// Label holding the cluster name of a series.
pub const CLUSTER: &str = "cluster";
/// Label holding the namespace of a series.
pub const NAMESPACE: &str = "namespace";
/// Label holding the scrape job of a series.
pub const JOB: &str = "job";
/// Label holding the scrape instance of a series.
pub const INSTANCE: &str = "instance";

/// Location value that the backend does not accept for written series.
const GLOBAL_LOCATION: &str = "global";

/// Errors validating [`ExternalLabels`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LabelsError {
    /// No tenant is configured.
    #[error("external label \"project_id\" must be set")]
    MissingProjectId,
    /// No location is configured.
    #[error("external label \"location\" must be set")]
    MissingLocation,
    /// The location is the literal `global`.
    #[error("external label \"location\" must not be \"global\"")]
    GlobalLocation,
}

/// The label overlay applied to every series, ordered by label name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ExternalLabels(BTreeMap<String, String>);

impl ExternalLabels {
    /// Creates an empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of a label, if set and non-empty.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Sets a label, replacing a previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Returns the configured tenant.
    pub fn project_id(&self) -> Option<&str> {
        self.get(PROJECT_ID)
    }

    /// Returns the configured location.
    pub fn location(&self) -> Option<&str> {
        self.get(LOCATION)
    }

    /// Returns the configured cluster.
    pub fn cluster(&self) -> Option<&str> {
        self.get(CLUSTER)
    }

    /// Returns the tenant derived from the project label.
    pub fn tenant(&self) -> Option<Tenant> {
        self.project_id().map(Tenant::from)
    }

    /// Iterates over all labels in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no labels are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fills unset identity labels from the configured defaults.
    ///
    /// Labels present in `self` always take precedence.
    pub fn with_defaults(mut self, defaults: &ExternalLabelDefaults) -> Self {
        let pairs = [
            (PROJECT_ID, &defaults.project_id),
            (LOCATION, &defaults.location),
            (CLUSTER, &defaults.cluster),
        ];

        for (name, value) in pairs {
            if self.get(name).is_none() && !value.is_empty() {
                self.insert(name, value.as_str());
            }
        }

        self
    }

    /// Checks that the identity labels required by the backend are present.
    pub fn validate(&self) -> Result<(), LabelsError> {
        if self.project_id().is_none() {
            return Err(LabelsError::MissingProjectId);
        }

        match self.location() {
            None => Err(LabelsError::MissingLocation),
            Some(GLOBAL_LOCATION) => Err(LabelsError::GlobalLocation),
            Some(_) => Ok(()),
        }
    }
}

impl<K, V> FromIterator<(K, V)> for ExternalLabels
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

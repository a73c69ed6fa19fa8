//! The remote write seam.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::series::{Tenant, TimeSeries};

/// Errors returned by a [`RemoteClient`] write.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The write did not complete within the send timeout.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    /// The backend rejected the credentials or the caller lacks permission for the tenant.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The backend rejected (parts of) the request.
    #[error("write rejected: {0}")]
    Rejected(String),
    /// The request could not be delivered.
    #[error("transport failure")]
    Transport(#[source] Box<dyn Error + Send + Sync>),
    /// The client has been closed.
    #[error("client is closed")]
    Closed,
}

impl SendError {
    /// Returns a short name of the error kind for use in metric tags.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Rejected(_) => "rejected",
            Self::Transport(_) => "transport",
            Self::Closed => "closed",
        }
    }
}

/// Writes batches of series to the metrics backend.
///
/// Implementations must be safe to call concurrently. The exporter issues one call per tenant
/// of a batch and never sends the same series in two concurrent calls.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Writes all `series` on behalf of `tenant`.
    async fn send(&self, tenant: &Tenant, series: Vec<TimeSeries>) -> Result<(), SendError>;

    /// Releases connections held by the client.
    async fn close(&self) -> Result<(), SendError>;
}

/// Options that determine how a [`RemoteClient`] is constructed.
///
/// A client is rebuilt only if these options change on reload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientOptions {
    /// The backend endpoint. Defaults to the client's built-in endpoint.
    pub endpoint: Option<String>,
    /// Path to a credentials file. Defaults to ambient credentials.
    pub credentials_file: Option<PathBuf>,
    /// Additional user agent to report.
    pub user_agent: Option<String>,
    /// Disables authentication, for local testing against fake backends.
    pub disable_auth: bool,
}

/// Errors creating a [`RemoteClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The endpoint is malformed.
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
    /// Credentials could not be loaded.
    #[error("failed to load credentials from {}", .path.display())]
    Credentials {
        /// The credentials file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Any other construction failure.
    #[error("failed to create client")]
    Other(#[source] Box<dyn Error + Send + Sync>),
}

/// Constructs [`RemoteClient`]s from [`ClientOptions`].
pub trait ClientFactory: Send + Sync {
    /// Creates a new client.
    fn create(&self, options: &ClientOptions) -> Result<Arc<dyn RemoteClient>, ClientError>;
}

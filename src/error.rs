//! Error types for the scale agent
//!
//! Errors carry the cluster they relate to so that log lines emitted at the
//! onboarding and tunnel boundaries can be correlated back to one simulated
//! cluster among thousands.

use thiserror::Error;

/// Main error type for scale agent operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No free port left in the configured scan range
    #[error("no ports available: scanned {scanned} candidates starting at {base}")]
    AllocationExhausted {
        /// First candidate port
        base: u16,
        /// Number of candidates examined
        scanned: u32,
    },

    /// A record with the same cluster ID or name already exists
    #[error("cluster already exists: {cluster}")]
    AlreadyExists {
        /// Conflicting cluster ID or name
        cluster: String,
    },

    /// No record with the given key
    #[error("cluster not found: {cluster}")]
    NotFound {
        /// Missing cluster ID or name
        cluster: String,
    },

    /// Invalid input (request body, cluster name, status transition)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// The backend provisioner failed to stand up an endpoint
    #[error("backend provisioning failed for {cluster}: {message}")]
    BackendProvisionFailed {
        /// Cluster being provisioned
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// The backend never answered its readiness query
    #[error("backend not ready for {cluster}: {message}")]
    BackendNotReady {
        /// Cluster being provisioned
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Fetching the onboarding manifest from the coordinator failed
    #[error("manifest fetch failed for {cluster}: {message}")]
    ManifestFetchFailed {
        /// Cluster being onboarded
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// The backend rejected the onboarding manifest
    #[error("manifest apply failed for {cluster}: {message}")]
    ManifestApplyFailed {
        /// Cluster being onboarded
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// The identity secret never materialized on the backend
    #[error("identity secret did not appear for {cluster} within {timeout_secs}s")]
    IdentityTimeout {
        /// Cluster being onboarded
        cluster: String,
        /// Poll budget that was exhausted
        timeout_secs: u64,
    },

    /// Credentials for a tunnel attempt could not be obtained or decoded
    #[error("tunnel auth failed for {cluster}: {message}")]
    TunnelAuthFailed {
        /// Cluster owning the tunnel
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// The tunnel transport failed or was closed by the remote
    #[error("tunnel transport error for {cluster}: {message}")]
    TunnelTransportError {
        /// Cluster owning the tunnel
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// The coordinator could not be reached or returned an unexpected answer
    #[error("coordinator unavailable: {message}")]
    CoordinatorUnavailable {
        /// Description of what failed
        message: String,
        /// HTTP status, when the coordinator answered at all
        status: Option<u16>,
    },

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
    },

    /// Snapshot read/write failure
    #[error("persistence error for {path}: {message}")]
    Persistence {
        /// File being read or written
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The operation was cancelled by shutdown or cluster deletion
    #[error("operation cancelled for {cluster}")]
    Cancelled {
        /// Cluster whose worker was cancelled
        cluster: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(cluster: impl Into<String>) -> Self {
        Self::AlreadyExists {
            cluster: cluster.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(cluster: impl Into<String>) -> Self {
        Self::NotFound {
            cluster: cluster.into(),
        }
    }

    /// Create a backend provisioning error
    pub fn provision_failed(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::BackendProvisionFailed {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a backend readiness error
    pub fn not_ready(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::BackendNotReady {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a manifest fetch error
    pub fn manifest_fetch(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ManifestFetchFailed {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a manifest apply error
    pub fn manifest_apply(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ManifestApplyFailed {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a tunnel auth error
    pub fn tunnel_auth(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TunnelAuthFailed {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a tunnel transport error
    pub fn tunnel_transport(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TunnelTransportError {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a coordinator error without an HTTP status
    pub fn coordinator(msg: impl Into<String>) -> Self {
        Self::CoordinatorUnavailable {
            message: msg.into(),
            status: None,
        }
    }

    /// Create a coordinator error for a non-success HTTP status
    pub fn coordinator_status(status: u16, msg: impl Into<String>) -> Self {
        Self::CoordinatorUnavailable {
            message: msg.into(),
            status: Some(status),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a persistence error for a file
    pub fn persistence(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(cluster: impl Into<String>) -> Self {
        Self::Cancelled {
            cluster: cluster.into(),
        }
    }

    /// Check if this error should drive a reconnect/retry rather than fail
    ///
    /// Onboarding step errors are terminal for the attempt; tunnel and
    /// coordinator errors feed the backoff loops.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TunnelAuthFailed { .. }
                | Error::TunnelTransportError { .. }
                | Error::CoordinatorUnavailable { .. }
        )
    }

    /// HTTP status carried by a coordinator error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::CoordinatorUnavailable { status, .. } => *status,
            _ => None,
        }
    }

    /// Get the cluster if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::AlreadyExists { cluster }
            | Error::NotFound { cluster }
            | Error::BackendProvisionFailed { cluster, .. }
            | Error::BackendNotReady { cluster, .. }
            | Error::ManifestFetchFailed { cluster, .. }
            | Error::ManifestApplyFailed { cluster, .. }
            | Error::IdentityTimeout { cluster, .. }
            | Error::TunnelAuthFailed { cluster, .. }
            | Error::TunnelTransportError { cluster, .. }
            | Error::Cancelled { cluster } => Some(cluster),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

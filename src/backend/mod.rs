//! Simulated cluster backends
//!
//! A backend is the Kubernetes-API-compatible endpoint each simulated cluster
//! exposes on its allocated port. Two seams keep onboarding independent of
//! how backends are run:
//!
//! - [`BackendProvisioner`] stands backends up, waits for them, hands out
//!   their credentials and tears them down ([`KwokProvisioner`] drives
//!   kwokctl)
//! - [`BackendApi`] talks to a running backend over HTTPS: manifest apply,
//!   identity secret lookup and reachability probes ([`HttpBackendApi`])

mod api;
mod kwok;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

pub use api::{decode_identity_token, manifest_documents, object_collection_path, HttpBackendApi};
pub use kwok::{KwokConfig, KwokProvisioner};

/// Namespace holding the identity secret written by the import manifest
pub const IDENTITY_NAMESPACE: &str = "cattle-system";

/// Name prefix of the identity secret
pub const IDENTITY_SECRET_PREFIX: &str = "cattle-credentials-";

/// Paths read during the lenient verification step
pub const VERIFY_PATHS: [&str; 2] = ["/version", "/api/v1/namespaces"];

/// Credentials the coordinator and the agent use to reach a backend
#[derive(Clone, PartialEq, Eq)]
pub struct BackendCredential {
    /// CA certificate PEM for the backend's serving certificate
    pub ca_cert: String,
    /// Bearer token accepted by the backend (empty for anonymous access)
    pub token: String,
}

impl std::fmt::Debug for BackendCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCredential")
            .field("ca_cert_len", &self.ca_cert.len())
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A running backend plus the credential to call it
#[derive(Clone, Debug)]
pub struct BackendEndpoint {
    /// Cluster the backend belongs to
    pub cluster_id: String,
    /// `host:port` the backend listens on
    pub address: String,
    /// Credential for the backend
    pub credential: BackendCredential,
}

impl BackendEndpoint {
    /// HTTPS base URL of the backend
    pub fn base_url(&self) -> String {
        format!("https://{}", self.address)
    }
}

/// Stands up and tears down backends
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendProvisioner: Send + Sync {
    /// Start a backend named `name` bound to `port`
    async fn provision(&self, name: &str, port: u16) -> Result<()>;

    /// Poll until the backend answers a basic identity query
    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<()>;

    /// CA and token for the backend
    async fn fetch_credential(&self, name: &str) -> Result<BackendCredential>;

    /// Stop the backend and delete its on-disk state
    async fn teardown(&self, name: &str) -> Result<()>;

    /// Names of every backend present on disk
    async fn inventory(&self) -> Result<Vec<String>>;

    /// Reattach to a backend left on disk by a previous process
    ///
    /// Returns `false` when nothing is left to restore.
    async fn restore(&self, name: &str) -> Result<bool>;

    /// Kubeconfig for the backend, when the provisioner writes one
    fn kubeconfig_path(&self, name: &str) -> Option<PathBuf>;
}

/// Calls made against a running backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Apply a multi-document manifest, returning the number of objects
    async fn apply_manifest(&self, endpoint: &BackendEndpoint, manifest: &str) -> Result<usize>;

    /// Identity token from the `cattle-credentials-*` secret, if present
    async fn identity_token(&self, endpoint: &BackendEndpoint) -> Result<Option<String>>;

    /// GET `path` and return the HTTP status
    async fn probe(&self, endpoint: &BackendEndpoint, path: &str) -> Result<u16>;
}

//! Onboarding state machine
//!
//! One pass per cluster, strictly in order:
//!
//! ```text
//! allocating -> provisioning -> awaiting_manifest -> applying_manifest
//!   -> awaiting_identity -> verifying -> ready
//! ```
//!
//! Any step error moves the record to `failed` and tears the backend down
//! exactly once. Verification is lenient: failed probes are logged with
//! `policy = "lenient_verify"` and counted on the record, and the run still
//! reaches `ready`. Reaching `ready` starts the registration tunnel.
//!
//! Cancellation (cluster delete or shutdown) stops the run where it is
//! without tearing down; whoever cancelled owns the cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendApi, BackendEndpoint, BackendProvisioner, VERIFY_PATHS};
use crate::config::AgentConfig;
use crate::coordinator::Coordinator;
use crate::registry::{ClusterRecord, ClusterRegistry, ClusterStatus};
use crate::tunnel::{TunnelManager, TunnelTarget};
use crate::{Error, Result};

/// Policy tag logged for tolerated verification failures
pub const LENIENT_VERIFY_POLICY: &str = "lenient_verify";

/// Step timeouts and poll cadence
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnboardingSettings {
    /// Budget for creating the backend and for it to answer
    pub provision_timeout: Duration,
    /// Budget for the identity secret to appear
    pub identity_timeout: Duration,
    /// Interval between identity secret checks
    pub identity_poll_interval: Duration,
}

impl From<&AgentConfig> for OnboardingSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            provision_timeout: config.provision_timeout(),
            identity_timeout: config.identity_timeout(),
            identity_poll_interval: config.identity_poll_interval(),
        }
    }
}

/// How an onboarding run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnboardingOutcome {
    /// Record is `ready` and the registration tunnel was started
    Ready,
    /// Record is `failed` and the backend was torn down
    Failed,
    /// Run was cancelled before finishing
    Cancelled,
}

/// Drives clusters through onboarding
pub struct Onboarding {
    registry: Arc<ClusterRegistry>,
    coordinator: Arc<dyn Coordinator>,
    provisioner: Arc<dyn BackendProvisioner>,
    backend: Arc<dyn BackendApi>,
    tunnels: Arc<TunnelManager>,
    settings: OnboardingSettings,
}

impl Onboarding {
    /// Create an onboarding driver
    pub fn new(
        registry: Arc<ClusterRegistry>,
        coordinator: Arc<dyn Coordinator>,
        provisioner: Arc<dyn BackendProvisioner>,
        backend: Arc<dyn BackendApi>,
        tunnels: Arc<TunnelManager>,
        settings: OnboardingSettings,
    ) -> Self {
        Self {
            registry,
            coordinator,
            provisioner,
            backend,
            tunnels,
            settings,
        }
    }

    /// Run onboarding for one cluster
    pub async fn run(&self, cluster_id: &str, cancel: CancellationToken) -> OnboardingOutcome {
        let Some(record) = self.registry.get(cluster_id) else {
            debug!(cluster_id = %cluster_id, "Record gone before onboarding started");
            return OnboardingOutcome::Cancelled;
        };

        info!(
            cluster_id = %cluster_id,
            backend = %record.local_name,
            port = record.port,
            "Onboarding started"
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.steps(&record) => Some(result),
        };

        match result {
            None => {
                info!(cluster_id = %cluster_id, "Onboarding cancelled");
                OnboardingOutcome::Cancelled
            }
            Some(Ok(())) => {
                info!(
                    cluster_id = %cluster_id,
                    verify_warnings = self.registry.get(cluster_id).map(|r| r.verify_warnings).unwrap_or_default(),
                    "Cluster ready"
                );
                self.tunnels.start_registration(
                    TunnelTarget {
                        cluster_id: record.cluster_id.clone(),
                        local_name: record.local_name.clone(),
                        backend_address: record.backend_address.clone(),
                    },
                    cancel,
                );
                OnboardingOutcome::Ready
            }
            Some(Err(_)) if cancel.is_cancelled() => {
                info!(cluster_id = %cluster_id, "Onboarding cancelled");
                OnboardingOutcome::Cancelled
            }
            Some(Err(e)) => {
                self.fail(&record, &e).await;
                OnboardingOutcome::Failed
            }
        }
    }

    fn advance(&self, cluster_id: &str, next: ClusterStatus) -> Result<()> {
        self.registry.transition(cluster_id, next)?;
        Ok(())
    }

    async fn steps(&self, record: &ClusterRecord) -> Result<()> {
        let id = record.cluster_id.as_str();
        let name = record.local_name.as_str();

        self.advance(id, ClusterStatus::Provisioning)?;
        self.provision(record).await?;
        let credential = self.provisioner.fetch_credential(name).await?;
        self.registry
            .set_kubeconfig_path(id, self.provisioner.kubeconfig_path(name));
        let endpoint = BackendEndpoint {
            cluster_id: id.to_string(),
            address: record.backend_address.clone(),
            credential,
        };

        self.advance(id, ClusterStatus::AwaitingManifest)?;
        let token = self
            .coordinator
            .registration_token(id)
            .await
            .map_err(|e| Error::manifest_fetch(id, format!("registration token: {}", e)))?;
        let manifest = self.coordinator.import_manifest(id, &token).await?;

        self.advance(id, ClusterStatus::ApplyingManifest)?;
        let applied = self.backend.apply_manifest(&endpoint, &manifest).await?;
        debug!(cluster_id = %id, objects = applied, "Import manifest applied");

        self.advance(id, ClusterStatus::AwaitingIdentity)?;
        self.await_identity(&endpoint).await?;

        self.advance(id, ClusterStatus::Verifying)?;
        self.verify(&endpoint).await;

        self.advance(id, ClusterStatus::Ready)
    }

    /// Create the backend and wait for it to answer, within one budget
    async fn provision(&self, record: &ClusterRecord) -> Result<()> {
        let name = record.local_name.as_str();
        let timeout = self.settings.provision_timeout;

        let provisioned = tokio::time::timeout(timeout, async {
            self.provisioner.provision(name, record.port).await?;
            self.provisioner.wait_ready(name, timeout).await
        })
        .await;

        provisioned.unwrap_or_else(|_| {
            Err(Error::not_ready(
                &record.cluster_id,
                format!("backend {} not ready within {}s", name, timeout.as_secs()),
            ))
        })
    }

    async fn await_identity(&self, endpoint: &BackendEndpoint) -> Result<()> {
        let id = &endpoint.cluster_id;
        let poll = self.settings.identity_poll_interval;
        let timeout = self.settings.identity_timeout;

        let found = tokio::time::timeout(timeout, async {
            loop {
                match self.backend.identity_token(endpoint).await {
                    Ok(Some(_)) => return,
                    Ok(None) => debug!(cluster_id = %id, "Identity secret not present yet"),
                    Err(e) => debug!(cluster_id = %id, error = %e, "Identity secret check failed"),
                }
                tokio::time::sleep(poll).await;
            }
        })
        .await;

        found.map_err(|_| Error::IdentityTimeout {
            cluster: id.clone(),
            timeout_secs: timeout.as_secs(),
        })
    }

    async fn verify(&self, endpoint: &BackendEndpoint) {
        let id = &endpoint.cluster_id;
        for path in VERIFY_PATHS {
            let failure = match self.backend.probe(endpoint, path).await {
                Ok(status) if (200..300).contains(&status) => None,
                Ok(status) => Some(format!("status {}", status)),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                let warnings = self.registry.record_verify_warning(id);
                warn!(
                    cluster_id = %id,
                    policy = LENIENT_VERIFY_POLICY,
                    path,
                    reason = %reason,
                    warnings,
                    "Verification request failed, continuing"
                );
            }
        }
    }

    async fn fail(&self, record: &ClusterRecord, err: &Error) {
        let id = &record.cluster_id;
        let step = self
            .registry
            .get(id)
            .map(|r| r.status.as_str())
            .unwrap_or("deleted");
        warn!(cluster_id = %id, step, error = %err, "Onboarding failed, tearing down backend");

        match self.registry.transition(id, ClusterStatus::Failed) {
            Ok(_) => {}
            Err(Error::NotFound { .. }) => {
                // Removed by delete or the orphan sweep, which owns the teardown
                debug!(cluster_id = %id, "Record already removed, skipping teardown");
                return;
            }
            Err(e) => debug!(cluster_id = %id, error = %e, "Could not mark cluster failed"),
        }
        if let Err(e) = self.provisioner.teardown(&record.local_name).await {
            warn!(cluster_id = %id, backend = %record.local_name, error = %e, "Teardown failed");
        }
    }
}

//! Process-level wiring
//!
//! [`ScaleAgent`] owns the registry, tunnel manager and onboarding driver,
//! and keeps one cancellation token per cluster as a child of the process
//! shutdown token. Deleting a cluster cancels only its own workers; shutdown
//! cancels everything.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator::{self, PortAllocator};
use crate::backend::{
    BackendApi, BackendProvisioner, HttpBackendApi, KwokConfig, KwokProvisioner,
};
use crate::config::AgentConfig;
use crate::coordinator::{Coordinator, HttpCoordinator};
use crate::onboarding::{Onboarding, OnboardingOutcome, OnboardingSettings};
use crate::poller::LivenessPoller;
use crate::registry::{ClusterRecord, ClusterRegistry, ClusterStatus};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::snapshot::{self, Snapshot};
use crate::tunnel::{
    SessionInfo, TunnelDialer, TunnelManager, TunnelRole, TunnelSettings, TunnelTarget,
    WebSocketDialer,
};
use crate::{Error, Result, RESERVED_CLUSTER_NAME};

/// Longest cluster name accepted (DNS-1123 label)
pub const MAX_CLUSTER_NAME_LEN: usize = 63;

/// External systems the agent talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Coordinator client
    pub coordinator: Arc<dyn Coordinator>,
    /// Backend provisioner
    pub provisioner: Arc<dyn BackendProvisioner>,
    /// Backend API client
    pub backend: Arc<dyn BackendApi>,
    /// Tunnel transport
    pub dialer: Arc<dyn TunnelDialer>,
}

impl Collaborators {
    /// Production collaborators: HTTP coordinator, kwokctl, WebSocket tunnels
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Ok(Self {
            coordinator: Arc::new(HttpCoordinator::new(config)?),
            provisioner: Arc::new(KwokProvisioner::new(KwokConfig {
                kwokctl_path: config.kwokctl_path.clone(),
                kubectl_path: config.kubectl_path.clone(),
                clusters_dir: config.kwok_clusters_dir.clone(),
                ready_poll_interval: config.ready_poll_interval(),
            })),
            backend: Arc::new(HttpBackendApi::new()),
            dialer: Arc::new(WebSocketDialer::new(config)?),
        })
    }
}

/// Detailed view of one cluster
#[derive(Clone, Debug, Serialize)]
pub struct ClusterView {
    /// Registry record
    #[serde(flatten)]
    pub record: ClusterRecord,
    /// Registration tunnel, if one has been started
    pub registration_tunnel: Option<SessionInfo>,
    /// Agent tunnel, if one has been started
    pub agent_tunnel: Option<SessionInfo>,
    /// Whether the liveness poller is running
    pub liveness_poll: bool,
}

/// Check a cluster name is a DNS-1123 label and not reserved
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("cluster name must not be empty"));
    }
    if name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(Error::validation(format!(
            "cluster name must be at most {} characters",
            MAX_CLUSTER_NAME_LEN
        )));
    }
    if name == RESERVED_CLUSTER_NAME {
        return Err(Error::validation(format!(
            "cluster name {:?} is reserved",
            RESERVED_CLUSTER_NAME
        )));
    }
    let valid_chars = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    let alnum_edges = !name.starts_with('-') && !name.ends_with('-');
    if !valid_chars || !alnum_edges {
        return Err(Error::validation(format!(
            "cluster name {:?} must be lowercase alphanumerics and '-', starting and ending with an alphanumeric",
            name
        )));
    }
    Ok(())
}

/// The running agent
pub struct ScaleAgent {
    config: AgentConfig,
    registry: Arc<ClusterRegistry>,
    coordinator: Arc<dyn Coordinator>,
    provisioner: Arc<dyn BackendProvisioner>,
    tunnels: Arc<TunnelManager>,
    poller: Arc<LivenessPoller>,
    onboarding: Arc<Onboarding>,
    shutdown: CancellationToken,
    workers: DashMap<String, CancellationToken>,
    snapshot_lock: parking_lot::Mutex<()>,
}

impl ScaleAgent {
    /// Wire the agent from its configuration and collaborators
    pub fn new(config: AgentConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        let Collaborators {
            coordinator,
            provisioner,
            backend,
            dialer,
        } = collaborators;

        let registry = Arc::new(ClusterRegistry::new(PortAllocator::new(
            config.base_port,
            config.port_step,
            config.port_scan_limit,
        )));
        let poller = Arc::new(LivenessPoller::new(
            coordinator.clone(),
            config.default_poll_interval(),
        ));
        let tunnels = Arc::new(TunnelManager::new(
            TunnelSettings {
                registration_url: config.tunnel_url(TunnelRole::Registration.path())?,
                agent_url: config.tunnel_url(TunnelRole::Agent.path())?,
                probe_address: config.probe_address.clone(),
            },
            coordinator.clone(),
            provisioner.clone(),
            backend.clone(),
            dialer,
            poller.clone(),
        ));
        let onboarding = Arc::new(Onboarding::new(
            registry.clone(),
            coordinator.clone(),
            provisioner.clone(),
            backend,
            tunnels.clone(),
            OnboardingSettings::from(&config),
        ));

        Ok(Arc::new(Self {
            config,
            registry,
            coordinator,
            provisioner,
            tunnels,
            poller,
            onboarding,
            shutdown: CancellationToken::new(),
            workers: DashMap::new(),
            snapshot_lock: parking_lot::Mutex::new(()),
        }))
    }

    /// Agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Cluster registry
    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    /// Tunnel manager
    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    /// Process shutdown token
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Clusters counted on the health endpoint
    pub fn cluster_count(&self) -> usize {
        self.registry
            .list()
            .iter()
            .filter(|r| r.name != RESERVED_CLUSTER_NAME)
            .count()
    }

    /// Detailed view of a cluster by name
    pub fn cluster_view(&self, name: &str) -> Option<ClusterView> {
        let record = self.registry.find_by_name(name)?;
        let id = record.cluster_id.clone();
        Some(ClusterView {
            registration_tunnel: self.tunnels.session(TunnelRole::Registration, &id),
            agent_tunnel: self.tunnels.session(TunnelRole::Agent, &id),
            liveness_poll: self.poller.is_active(&id),
            record,
        })
    }

    fn worker_token(&self, cluster_id: &str) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.workers.insert(cluster_id.to_string(), token.clone());
        token
    }

    fn stop_workers(&self, cluster_id: &str) {
        if let Some((_, token)) = self.workers.remove(cluster_id) {
            token.cancel();
        }
        self.tunnels.forget(cluster_id);
    }

    fn target(record: &ClusterRecord) -> TunnelTarget {
        TunnelTarget {
            cluster_id: record.cluster_id.clone(),
            local_name: record.local_name.clone(),
            backend_address: record.backend_address.clone(),
        }
    }

    /// Create a cluster and start onboarding it in the background
    ///
    /// Fails synchronously only for invalid names, conflicts, coordinator
    /// errors and port exhaustion; onboarding failures surface later as the
    /// record's `failed` status.
    pub async fn create_cluster(self: &Arc<Self>, name: &str) -> Result<ClusterRecord> {
        if self.shutdown.is_cancelled() {
            return Err(Error::cancelled(name));
        }
        validate_cluster_name(name)?;
        if self.registry.find_by_name(name).is_some() {
            return Err(Error::already_exists(name));
        }

        let cluster_id = self.coordinator.create_cluster(name).await?;

        let on_disk = match self.provisioner.inventory().await {
            Ok(names) => allocator::ports_in_inventory(&names),
            Err(e) => {
                warn!(error = %e, "Failed to read backend inventory, allocating from memory only");
                Default::default()
            }
        };

        let record = match self.registry.create(&cluster_id, name, &on_disk) {
            Ok(record) => record,
            Err(e) => {
                if let Err(cleanup) = self.coordinator.delete_cluster(&cluster_id).await {
                    warn!(
                        cluster_id = %cluster_id,
                        error = %cleanup,
                        "Failed to roll back coordinator cluster"
                    );
                }
                return Err(e);
            }
        };

        let token = self.worker_token(&cluster_id);
        let agent = self.clone();
        tokio::spawn(async move {
            let outcome = agent.onboarding.run(&cluster_id, token).await;
            if outcome != OnboardingOutcome::Cancelled {
                agent.persist();
            }
        });
        self.persist();

        Ok(record)
    }

    /// Delete a cluster by name
    ///
    /// Local state goes first; the coordinator delete is best-effort.
    pub async fn delete_cluster(&self, name: &str) -> Result<ClusterRecord> {
        let record = self
            .registry
            .find_by_name(name)
            .ok_or_else(|| Error::not_found(name))?;
        let id = record.cluster_id.as_str();

        self.stop_workers(id);
        self.registry.delete(id)?;
        info!(cluster_id = %id, name = %name, "Deleting cluster");

        if let Err(e) = self.provisioner.teardown(&record.local_name).await {
            warn!(cluster_id = %id, backend = %record.local_name, error = %e, "Teardown failed");
        }

        let deleted = retry_with_backoff(
            &RetryConfig::with_max_attempts(3),
            "coordinator cluster delete",
            || self.coordinator.delete_cluster(id),
        )
        .await;
        if let Err(e) = deleted {
            warn!(cluster_id = %id, error = %e, "Coordinator still lists the cluster");
        }
        self.coordinator.forget(id);

        self.persist();
        Ok(record)
    }

    /// Reload the snapshot and reattach to surviving backends
    ///
    /// Returns the number of records put back in the registry.
    pub async fn restore(self: &Arc<Self>) -> Result<usize> {
        let path = self.config.snapshot_path();
        let records = snapshot::load(&path)?.into_records();
        let mut restored = 0;

        for mut record in records {
            let id = record.cluster_id.clone();
            if record.status.is_in_progress() {
                warn!(
                    cluster_id = %id,
                    status = %record.status,
                    "Onboarding was interrupted, marking failed"
                );
                record.status = ClusterStatus::Failed;
                if let Err(e) = self.provisioner.teardown(&record.local_name).await {
                    warn!(cluster_id = %id, error = %e, "Teardown failed");
                }
            } else if record.status == ClusterStatus::Ready {
                match self.provisioner.restore(&record.local_name).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(cluster_id = %id, "Backend is gone, dropping record");
                        continue;
                    }
                    Err(e) => {
                        warn!(cluster_id = %id, error = %e, "Backend could not be restored, dropping record");
                        continue;
                    }
                }
            }

            let ready = record.status == ClusterStatus::Ready;
            let target = Self::target(&record);
            if let Err(e) = self.registry.insert_restored(record) {
                warn!(cluster_id = %id, error = %e, "Skipping duplicate snapshot record");
                continue;
            }
            if ready {
                let token = self.worker_token(&id);
                self.tunnels.start_registration(target, token);
            }
            restored += 1;
        }

        info!(restored, path = %path.display(), "Snapshot restored");
        self.persist();
        Ok(restored)
    }

    /// Reap clusters the coordinator no longer lists
    pub async fn sweep_orphans(&self) -> Result<Vec<String>> {
        let active = self.coordinator.list_cluster_ids().await?;
        let removed = self.registry.remove_orphans(&active);

        // Workers go first so an in-flight onboarding run cannot tear down
        // the same backend
        for record in &removed {
            self.stop_workers(&record.cluster_id);
            self.coordinator.forget(&record.cluster_id);
        }
        let reaped = self
            .registry
            .reap_backends(&removed, &active, self.provisioner.as_ref())
            .await;

        let removed: Vec<String> = removed.into_iter().map(|r| r.cluster_id).collect();
        if !removed.is_empty() || !reaped.is_empty() {
            info!(
                clusters = removed.len(),
                backends = reaped.len(),
                "Removed orphaned clusters"
            );
            self.persist();
        }
        Ok(removed)
    }

    /// Write the snapshot now
    pub fn save_snapshot(&self) -> Result<()> {
        let _guard = self.snapshot_lock.lock();
        snapshot::save(
            &self.config.snapshot_path(),
            &Snapshot::from_records(&self.registry.list()),
        )
    }

    fn persist(&self) {
        if let Err(e) = self.save_snapshot() {
            warn!(error = %e, "Failed to write snapshot");
        }
    }

    /// Start the periodic snapshot and orphan sweep loops
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let agent = self.clone();
        let interval = Duration::from_secs(self.config.snapshot_interval_secs);
        handles.push(tokio::spawn(async move {
            agent
                .every(interval, "snapshot", |agent| async move {
                    agent.persist();
                })
                .await
        }));

        if self.config.cleanup_interval_secs > 0 {
            let agent = self.clone();
            let interval = Duration::from_secs(self.config.cleanup_interval_secs);
            handles.push(tokio::spawn(async move {
                agent
                    .every(interval, "orphan sweep", |agent| async move {
                        if let Err(e) = agent.sweep_orphans().await {
                            warn!(error = %e, "Orphan sweep failed");
                        }
                    })
                    .await
            }));
        }

        handles
    }

    async fn every<F, Fut>(self: Arc<Self>, interval: Duration, name: &str, mut tick: F)
    where
        F: FnMut(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        debug!(task = name, interval_secs = interval.as_secs(), "Background task started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => tick(self.clone()).await,
            }
        }
        debug!(task = name, "Background task stopped");
    }

    /// Cancel every worker and write the final snapshot
    pub fn shutdown(&self) -> Result<()> {
        info!(clusters = self.registry.len(), "Shutting down");
        self.shutdown.cancel();
        self.save_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCredential, MockBackendApi, MockBackendProvisioner};
    use crate::coordinator::MockCoordinator;
    use crate::tunnel::MockTunnelDialer;
    use std::collections::HashSet;

    fn config(dir: &std::path::Path) -> AgentConfig {
        AgentConfig::from_yaml(&format!(
            "coordinator_url: https://rancher.example.com\nbearer_token: token-abc\nstate_dir: {}\n",
            dir.display()
        ))
        .unwrap()
    }

    fn agent(
        dir: &std::path::Path,
        coordinator: MockCoordinator,
        provisioner: MockBackendProvisioner,
    ) -> Arc<ScaleAgent> {
        ScaleAgent::new(
            config(dir),
            Collaborators {
                coordinator: Arc::new(coordinator),
                provisioner: Arc::new(provisioner),
                backend: Arc::new(MockBackendApi::new()),
                dialer: Arc::new(MockTunnelDialer::new()),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_cluster_name_validation() {
        for name in ["c1", "scale-0001", "a", &"x".repeat(63)] {
            assert!(validate_cluster_name(name).is_ok(), "{name}");
        }
        for name in ["", "template", "C1", "-c1", "c1-", "c_1", "c.1", &"x".repeat(64)] {
            assert!(
                matches!(validate_cluster_name(name), Err(Error::Validation { .. })),
                "{name}"
            );
        }
    }

    /// Story: bad or conflicting names are refused before the coordinator
    /// is asked to create anything
    #[tokio::test]
    async fn story_create_rejects_without_calling_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = MockCoordinator::new();
        coordinator.expect_create_cluster().never();

        let agent = agent(dir.path(), coordinator, MockBackendProvisioner::new());
        agent
            .registry()
            .create("c-existing", "c1", &HashSet::new())
            .unwrap();

        assert!(matches!(
            agent.create_cluster("template").await,
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            agent.create_cluster("c1").await,
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_refused_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = MockCoordinator::new();
        coordinator.expect_create_cluster().never();

        let agent = agent(dir.path(), coordinator, MockBackendProvisioner::new());
        agent.shutdown().unwrap();
        assert!(matches!(
            agent.create_cluster("c1").await,
            Err(Error::Cancelled { .. })
        ));
        assert!(dir.path().join(snapshot::SNAPSHOT_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent(dir.path(), MockCoordinator::new(), MockBackendProvisioner::new());
        assert!(matches!(
            agent.delete_cluster("nope").await,
            Err(Error::NotFound { .. })
        ));
    }

    /// Story: on restart, ready clusters with a surviving backend come back,
    /// interrupted ones come back failed and torn down, and ready clusters
    /// whose backend vanished are dropped
    #[tokio::test]
    async fn story_restore_reconciles_snapshot() {
        let dir = tempfile::tempdir().unwrap();

        let mut ready = ClusterRecord::new("c-ready", "ready", 8001);
        ready.status = ClusterStatus::Ready;
        let mut interrupted = ClusterRecord::new("c-mid", "mid", 8011);
        interrupted.status = ClusterStatus::AwaitingIdentity;
        let mut vanished = ClusterRecord::new("c-gone", "gone", 8021);
        vanished.status = ClusterStatus::Ready;
        snapshot::save(
            &dir.path().join(snapshot::SNAPSHOT_FILE_NAME),
            &Snapshot::from_records([&ready, &interrupted, &vanished]),
        )
        .unwrap();

        let mut provisioner = MockBackendProvisioner::new();
        provisioner
            .expect_restore()
            .returning(|name| Ok(name == "backend-c-ready-8001"));
        provisioner
            .expect_teardown()
            .withf(|name| name == "backend-c-mid-8011")
            .times(1)
            .returning(|_| Ok(()));
        provisioner.expect_fetch_credential().returning(|_| {
            Ok(BackendCredential {
                ca_cert: "PEM".to_string(),
                token: "backend-token".to_string(),
            })
        });

        let mut coordinator = MockCoordinator::new();
        coordinator
            .expect_registration_token()
            .returning(|_| Ok("reg-token".to_string()));

        let mut dialer = MockTunnelDialer::new();
        dialer
            .expect_connect()
            .returning(|request| Err(Error::tunnel_transport(&request.cluster_id, "offline")));

        let agent = ScaleAgent::new(
            config(dir.path()),
            Collaborators {
                coordinator: Arc::new(coordinator),
                provisioner: Arc::new(provisioner),
                backend: Arc::new(MockBackendApi::new()),
                dialer: Arc::new(dialer),
            },
        )
        .unwrap();

        assert_eq!(agent.restore().await.unwrap(), 2);
        assert_eq!(
            agent.registry().get("c-ready").unwrap().status,
            ClusterStatus::Ready
        );
        assert_eq!(
            agent.registry().get("c-mid").unwrap().status,
            ClusterStatus::Failed
        );
        assert!(agent.registry().get("c-gone").is_none());
        assert!(agent
            .cluster_view("ready")
            .unwrap()
            .registration_tunnel
            .is_some());

        agent.shutdown().unwrap();
    }
}

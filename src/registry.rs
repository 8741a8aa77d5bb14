//! Cluster registry
//!
//! Single source of truth for which simulated clusters exist. Records are
//! keyed by coordinator-assigned cluster ID; names are unique as well since
//! the HTTP surface addresses clusters by name. The map lives behind one
//! `RwLock` that is never held across I/O: callers gather anything slow
//! (provisioner inventory, teardown) outside the lock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::allocator::{self, PortAllocator};
use crate::backend::BackendProvisioner;
use crate::{Error, Result};

/// Lifecycle status of a simulated cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Record created, port reserved
    Allocating,
    /// Backend being stood up
    Provisioning,
    /// Fetching the import manifest from the coordinator
    AwaitingManifest,
    /// Submitting the manifest to the backend
    ApplyingManifest,
    /// Waiting for the identity secret to appear
    AwaitingIdentity,
    /// Probing backend API paths
    Verifying,
    /// Onboarding finished, tunnels running
    Ready,
    /// Onboarding failed, backend torn down
    Failed,
}

impl ClusterStatus {
    /// Onboarding order, excluding `Failed`
    pub const SEQUENCE: [ClusterStatus; 7] = [
        ClusterStatus::Allocating,
        ClusterStatus::Provisioning,
        ClusterStatus::AwaitingManifest,
        ClusterStatus::ApplyingManifest,
        ClusterStatus::AwaitingIdentity,
        ClusterStatus::Verifying,
        ClusterStatus::Ready,
    ];

    /// Next status in the onboarding sequence
    pub fn next(self) -> Option<ClusterStatus> {
        let idx = Self::SEQUENCE.iter().position(|s| *s == self)?;
        Self::SEQUENCE.get(idx + 1).copied()
    }

    /// Whether the transition `self -> next` is allowed
    ///
    /// Onboarding advances one step at a time; any status other than
    /// `Failed` may drop to `Failed`.
    pub fn can_transition_to(self, next: ClusterStatus) -> bool {
        match next {
            ClusterStatus::Failed => self != ClusterStatus::Failed,
            _ => self.next() == Some(next),
        }
    }

    /// `Ready` and `Failed` end an onboarding run
    pub fn is_terminal(self) -> bool {
        matches!(self, ClusterStatus::Ready | ClusterStatus::Failed)
    }

    /// Statuses between `Allocating` and `Ready`
    pub fn is_in_progress(self) -> bool {
        !self.is_terminal()
    }

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Allocating => "allocating",
            ClusterStatus::Provisioning => "provisioning",
            ClusterStatus::AwaitingManifest => "awaiting_manifest",
            ClusterStatus::ApplyingManifest => "applying_manifest",
            ClusterStatus::AwaitingIdentity => "awaiting_identity",
            ClusterStatus::Verifying => "verifying",
            ClusterStatus::Ready => "ready",
            ClusterStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One simulated cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Coordinator-assigned cluster ID
    pub cluster_id: String,
    /// Human name used on the HTTP surface
    pub name: String,
    /// Backend name, `backend-<cluster_id>-<port>`
    pub local_name: String,
    /// Backend port
    pub port: u16,
    /// Lifecycle status
    pub status: ClusterStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Backend address, `127.0.0.1:<port>`
    pub backend_address: String,
    /// Backend kubeconfig, once provisioned
    #[serde(default)]
    pub kubeconfig_path: Option<PathBuf>,
    /// Lenient verification failures seen during onboarding
    #[serde(default)]
    pub verify_warnings: u32,
}

impl ClusterRecord {
    /// Build a fresh `allocating` record for a port
    pub fn new(cluster_id: &str, name: &str, port: u16) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            name: name.to_string(),
            local_name: allocator::backend_name(cluster_id, port),
            port,
            status: ClusterStatus::Allocating,
            created_at: Utc::now(),
            backend_address: allocator::backend_address(port),
            kubeconfig_path: None,
            verify_warnings: 0,
        }
    }
}

/// Concurrency-safe map of cluster ID to record
pub struct ClusterRegistry {
    clusters: RwLock<HashMap<String, ClusterRecord>>,
    allocator: PortAllocator,
}

impl ClusterRegistry {
    /// Create an empty registry
    pub fn new(allocator: PortAllocator) -> Self {
        Self {
            clusters: RwLock::new(HashMap::new()),
            allocator,
        }
    }

    /// Create and insert an `allocating` record
    ///
    /// The ID/name conflict check, the port scan and the insert all happen
    /// under one write lock. `on_disk` is the provisioner's port inventory,
    /// gathered by the caller before calling so no I/O runs under the lock.
    pub fn create(
        &self,
        cluster_id: &str,
        name: &str,
        on_disk: &HashSet<u16>,
    ) -> Result<ClusterRecord> {
        let mut clusters = self.clusters.write();

        if clusters.contains_key(cluster_id) {
            return Err(Error::already_exists(cluster_id));
        }
        if clusters.values().any(|r| r.name == name) {
            return Err(Error::already_exists(name));
        }

        let in_memory: HashSet<u16> = clusters
            .values()
            .filter(|r| r.status != ClusterStatus::Failed)
            .map(|r| r.port)
            .collect();
        let port = self.allocator.allocate(&in_memory, on_disk)?;

        let record = ClusterRecord::new(cluster_id, name, port);
        clusters.insert(cluster_id.to_string(), record.clone());

        info!(
            cluster_id = %cluster_id,
            name = %name,
            port,
            backend = %record.local_name,
            "Cluster record created"
        );
        Ok(record)
    }

    /// Insert a record loaded from a snapshot
    pub fn insert_restored(&self, record: ClusterRecord) -> Result<()> {
        let mut clusters = self.clusters.write();
        if clusters.contains_key(&record.cluster_id)
            || clusters.values().any(|r| r.name == record.name)
        {
            return Err(Error::already_exists(&record.cluster_id));
        }
        clusters.insert(record.cluster_id.clone(), record);
        Ok(())
    }

    /// Get a record by cluster ID
    pub fn get(&self, cluster_id: &str) -> Option<ClusterRecord> {
        self.clusters.read().get(cluster_id).cloned()
    }

    /// Get a record by name
    pub fn find_by_name(&self, name: &str) -> Option<ClusterRecord> {
        self.clusters
            .read()
            .values()
            .find(|r| r.name == name)
            .cloned()
    }

    /// All records, sorted by name
    pub fn list(&self) -> Vec<ClusterRecord> {
        let mut records: Vec<ClusterRecord> = self.clusters.read().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.clusters.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.clusters.read().is_empty()
    }

    /// Remove a record
    pub fn delete(&self, cluster_id: &str) -> Result<ClusterRecord> {
        self.clusters
            .write()
            .remove(cluster_id)
            .ok_or_else(|| Error::not_found(cluster_id))
    }

    /// Move a record to `next`, checked against the transition table
    ///
    /// Returns the previous status.
    pub fn transition(&self, cluster_id: &str, next: ClusterStatus) -> Result<ClusterStatus> {
        let mut clusters = self.clusters.write();
        let record = clusters
            .get_mut(cluster_id)
            .ok_or_else(|| Error::not_found(cluster_id))?;

        let previous = record.status;
        if !previous.can_transition_to(next) {
            return Err(Error::validation(format!(
                "invalid status transition for {}: {} -> {}",
                cluster_id, previous, next
            )));
        }
        record.status = next;
        drop(clusters);

        debug!(cluster_id = %cluster_id, from = %previous, to = %next, "Cluster status changed");
        Ok(previous)
    }

    /// Count one lenient verification failure
    pub fn record_verify_warning(&self, cluster_id: &str) -> u32 {
        let mut clusters = self.clusters.write();
        match clusters.get_mut(cluster_id) {
            Some(record) => {
                record.verify_warnings += 1;
                record.verify_warnings
            }
            None => 0,
        }
    }

    /// Remember where the backend kubeconfig lives
    pub fn set_kubeconfig_path(&self, cluster_id: &str, path: Option<PathBuf>) {
        if let Some(record) = self.clusters.write().get_mut(cluster_id) {
            record.kubeconfig_path = path;
        }
    }

    /// Remove every record whose ID is not in `active`
    ///
    /// Only touches memory. Callers stop the removed clusters' workers before
    /// handing the records to [`ClusterRegistry::reap_backends`].
    pub fn remove_orphans(&self, active: &HashSet<String>) -> Vec<ClusterRecord> {
        let mut clusters = self.clusters.write();
        let orphaned: Vec<String> = clusters
            .keys()
            .filter(|id| !active.contains(*id))
            .cloned()
            .collect();
        orphaned
            .iter()
            .filter_map(|id| clusters.remove(id))
            .collect()
    }

    /// Tear down the backends of `removed` plus any on-disk backend whose ID
    /// is not in `active`
    ///
    /// The on-disk pass catches backends left behind by a previous process.
    /// Each backend is torn down at most once. Returns the backend names.
    pub async fn reap_backends(
        &self,
        removed: &[ClusterRecord],
        active: &HashSet<String>,
        provisioner: &dyn BackendProvisioner,
    ) -> Vec<String> {
        let mut doomed: BTreeSet<String> = removed.iter().map(|r| r.local_name.clone()).collect();

        match provisioner.inventory().await {
            Ok(names) => {
                for name in names {
                    let Some((cluster_id, _)) = allocator::parse_backend_name(&name) else {
                        continue;
                    };
                    // Records created after `active` was listed
                    let tracked = self.clusters.read().contains_key(&cluster_id);
                    if !active.contains(&cluster_id) && !tracked {
                        doomed.insert(name);
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to list on-disk backends, sweeping registry only");
            }
        }

        for name in &doomed {
            info!(backend = %name, "Tearing down orphaned backend");
            if let Err(e) = provisioner.teardown(name).await {
                warn!(backend = %name, error = %e, "Failed to tear down orphaned backend");
            }
        }

        doomed.into_iter().collect()
    }
}

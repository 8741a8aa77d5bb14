//! Registry persistence
//!
//! The registry is written as one JSON document keyed by cluster name:
//!
//! ```json
//! {"version": 1, "clusters": {"c1": {"name": "c1", "cluster_id": "c-abc",
//!   "backend_name": "backend-c-abc-8001", "port": 8001,
//!   "kubeconfig_path": null, "status": "ready", "created_at": "..."}}}
//! ```
//!
//! Writes go to a temp file in the same directory and are renamed over the
//! previous snapshot, so a crash never leaves a torn file behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::allocator;
use crate::registry::{ClusterRecord, ClusterStatus};
use crate::{Error, Result};

/// File name of the snapshot inside the state directory
pub const SNAPSHOT_FILE_NAME: &str = "clusters.json";

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// One persisted cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedCluster {
    /// Cluster name
    pub name: String,
    /// Coordinator-assigned cluster ID
    pub cluster_id: String,
    /// Backend name
    pub backend_name: String,
    /// Backend port
    pub port: u16,
    /// Backend kubeconfig
    #[serde(default)]
    pub kubeconfig_path: Option<PathBuf>,
    /// Status when the snapshot was taken
    pub status: ClusterStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl From<&ClusterRecord> for PersistedCluster {
    fn from(record: &ClusterRecord) -> Self {
        Self {
            name: record.name.clone(),
            cluster_id: record.cluster_id.clone(),
            backend_name: record.local_name.clone(),
            port: record.port,
            kubeconfig_path: record.kubeconfig_path.clone(),
            status: record.status,
            created_at: record.created_at,
        }
    }
}

impl PersistedCluster {
    /// Rebuild a registry record
    pub fn into_record(self) -> ClusterRecord {
        ClusterRecord {
            backend_address: allocator::backend_address(self.port),
            cluster_id: self.cluster_id,
            name: self.name,
            local_name: self.backend_name,
            port: self.port,
            status: self.status,
            created_at: self.created_at,
            kubeconfig_path: self.kubeconfig_path,
            verify_warnings: 0,
        }
    }
}

/// The snapshot document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format version
    pub version: u32,
    /// Clusters keyed by name
    #[serde(default)]
    pub clusters: BTreeMap<String, PersistedCluster>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            clusters: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    /// Capture a set of records
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ClusterRecord>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            clusters: records
                .into_iter()
                .map(|r| (r.name.clone(), PersistedCluster::from(r)))
                .collect(),
        }
    }

    /// Records in name order
    pub fn into_records(self) -> Vec<ClusterRecord> {
        self.clusters
            .into_values()
            .map(PersistedCluster::into_record)
            .collect()
    }
}

fn persistence_error(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::persistence(path.display().to_string(), err.to_string())
}

/// Write `snapshot` to `path` atomically
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| persistence_error(dir, e))?;

    let json = serde_json::to_vec_pretty(snapshot)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| SNAPSHOT_FILE_NAME.to_string());
    let tmp = dir.join(format!(".{}.tmp", file_name));

    std::fs::write(&tmp, json).map_err(|e| persistence_error(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(persistence_error(path, e));
    }

    debug!(path = %path.display(), clusters = snapshot.clusters.len(), "Snapshot written");
    Ok(())
}

/// Load the snapshot at `path`; a missing file is an empty snapshot
pub fn load(path: &Path) -> Result<Snapshot> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No snapshot found");
            return Ok(Snapshot::default());
        }
        Err(e) => return Err(persistence_error(path, e)),
    };

    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    if snapshot.version > SNAPSHOT_VERSION {
        warn!(
            path = %path.display(),
            version = snapshot.version,
            "Snapshot written by a newer version, loading anyway"
        );
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::PortAllocator;
    use crate::registry::ClusterRegistry;
    use std::collections::HashSet;

    /// Story: a registry written to disk and loaded into a fresh registry
    /// keeps every cluster's ID, port and status
    #[test]
    fn story_registry_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join(SNAPSHOT_FILE_NAME);

        let registry = ClusterRegistry::new(PortAllocator::new(8001, 10, 100));
        for (id, name) in [("c-a", "alpha"), ("c-b", "bravo"), ("c-c", "charlie")] {
            registry.create(id, name, &HashSet::new()).unwrap();
        }
        registry.transition("c-a", ClusterStatus::Provisioning).unwrap();
        registry.transition("c-b", ClusterStatus::Failed).unwrap();

        save(&path, &Snapshot::from_records(&registry.list())).unwrap();

        let restored = ClusterRegistry::new(PortAllocator::new(8001, 10, 100));
        for record in load(&path).unwrap().into_records() {
            restored.insert_restored(record).unwrap();
        }

        let summary = |r: &ClusterRegistry| {
            r.list()
                .into_iter()
                .map(|c| (c.cluster_id, c.port, c.status))
                .collect::<Vec<_>>()
        };
        assert_eq!(summary(&restored), summary(&registry));
        assert_eq!(
            restored.get("c-a").unwrap().backend_address,
            "127.0.0.1:8001"
        );
    }

    #[test]
    fn test_wire_format() {
        let record = ClusterRecord::new("c-abc", "c1", 8001);
        let value = serde_json::to_value(Snapshot::from_records([&record])).unwrap();

        assert_eq!(value["version"], 1);
        let c1 = &value["clusters"]["c1"];
        assert_eq!(c1["cluster_id"], "c-abc");
        assert_eq!(c1["backend_name"], "backend-c-abc-8001");
        assert_eq!(c1["port"], 8001);
        assert_eq!(c1["status"], "allocating");
        assert!(c1["kubeconfig_path"].is_null());
        assert!(c1["created_at"].is_string());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = load(&dir.path().join(SNAPSHOT_FILE_NAME)).unwrap();
        assert!(snapshot.clusters.is_empty());
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
    }

    #[test]
    fn test_save_replaces_previous_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE_NAME);

        let first = ClusterRecord::new("c-1", "one", 8001);
        save(&path, &Snapshot::from_records([&first])).unwrap();
        save(&path, &Snapshot::default()).unwrap();

        assert!(load(&path).unwrap().clusters.is_empty());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from(SNAPSHOT_FILE_NAME)]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE_NAME);
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load(&path), Err(Error::Serialization { .. })));
    }
}

//! Port and backend name allocation
//!
//! Candidate ports start at a base and advance in fixed steps. A candidate is
//! skipped when a live registry record holds it or when the provisioner still
//! has an on-disk backend bound to it, which protects against allocator state
//! lost across restarts. The scan is bounded and fails closed.

use std::collections::HashSet;

use crate::{Error, Result};

/// Prefix of every backend name
pub const BACKEND_PREFIX: &str = "backend-";

/// Bounded port scanner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortAllocator {
    base: u16,
    step: u16,
    limit: u32,
}

impl PortAllocator {
    /// Create an allocator scanning `limit` candidates from `base` by `step`
    pub fn new(base: u16, step: u16, limit: u32) -> Self {
        Self {
            base,
            step: step.max(1),
            limit,
        }
    }

    /// Pick the first candidate not held in memory or on disk
    ///
    /// Must be called under the registry write lock so the chosen port is
    /// committed before another create can scan.
    pub fn allocate(&self, in_memory: &HashSet<u16>, on_disk: &HashSet<u16>) -> Result<u16> {
        for offset in 0..self.limit {
            let candidate = u32::from(self.base) + u32::from(self.step) * offset;
            let Ok(port) = u16::try_from(candidate) else {
                break;
            };
            if !in_memory.contains(&port) && !on_disk.contains(&port) {
                return Ok(port);
            }
        }
        Err(Error::AllocationExhausted {
            base: self.base,
            scanned: self.limit,
        })
    }
}

/// Backend name for a cluster: `backend-<cluster_id>-<port>`
pub fn backend_name(cluster_id: &str, port: u16) -> String {
    format!("{}{}-{}", BACKEND_PREFIX, cluster_id, port)
}

/// Split a backend name into cluster ID and port
///
/// Cluster IDs may themselves contain dashes, so the port is taken from the
/// last segment.
pub fn parse_backend_name(name: &str) -> Option<(String, u16)> {
    let rest = name.strip_prefix(BACKEND_PREFIX)?;
    let (cluster_id, port) = rest.rsplit_once('-')?;
    if cluster_id.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((cluster_id.to_string(), port))
}

/// Ports held by on-disk backends, ignoring names that do not parse
pub fn ports_in_inventory<'a>(names: impl IntoIterator<Item = &'a String>) -> HashSet<u16> {
    names
        .into_iter()
        .filter_map(|name| parse_backend_name(name).map(|(_, port)| port))
        .collect()
}

/// Loopback address of a backend bound to `port`
pub fn backend_address(port: u16) -> String {
    format!("127.0.0.1:{}", port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_free_candidate() {
        let allocator = PortAllocator::new(8001, 10, 100);
        let in_memory: HashSet<u16> = [8001, 8011].into_iter().collect();
        let on_disk: HashSet<u16> = [8021].into_iter().collect();

        assert_eq!(allocator.allocate(&in_memory, &on_disk).unwrap(), 8031);
        assert_eq!(
            allocator.allocate(&HashSet::new(), &HashSet::new()).unwrap(),
            8001
        );
    }

    #[test]
    fn test_exhaustion_fails_closed() {
        let allocator = PortAllocator::new(9000, 1, 3);
        let used: HashSet<u16> = [9000, 9001, 9002].into_iter().collect();

        let err = allocator.allocate(&used, &HashSet::new()).unwrap_err();
        assert!(matches!(
            err,
            Error::AllocationExhausted {
                base: 9000,
                scanned: 3
            }
        ));
    }

    #[test]
    fn test_scan_stops_at_u16_boundary() {
        let allocator = PortAllocator::new(65530, 10, 100);
        let used: HashSet<u16> = [65530].into_iter().collect();
        assert!(allocator.allocate(&used, &HashSet::new()).is_err());
    }

    #[test]
    fn test_backend_name_round_trips_dashed_ids() {
        let name = backend_name("c-m-abc12", 8041);
        assert_eq!(name, "backend-c-m-abc12-8041");
        assert_eq!(
            parse_backend_name(&name),
            Some(("c-m-abc12".to_string(), 8041))
        );
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(parse_backend_name("kind-dev"), None);
        assert_eq!(parse_backend_name("backend-abc"), None);
        assert_eq!(parse_backend_name("backend--8001"), None);
        assert_eq!(parse_backend_name("backend-c1-notaport"), None);
    }

    #[test]
    fn test_ports_in_inventory() {
        let names = vec![
            "backend-c1-8001".to_string(),
            "backend-c2-8011".to_string(),
            "unrelated".to_string(),
        ];
        let ports = ports_in_inventory(&names);
        assert_eq!(ports, [8001, 8011].into_iter().collect());
    }
}

//! Liveness/config poller
//!
//! Once a cluster's registration tunnel connects, the poller calls the
//! coordinator's connect-config endpoint with the same tunnel headers on a
//! fixed cadence. The coordinator may hand back a new interval; a 404 or a
//! transport error is logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, RegistrationHeaders};

/// One poll worker per cluster
pub struct LivenessPoller {
    coordinator: Arc<dyn Coordinator>,
    default_interval: Duration,
    active: DashSet<String>,
}

impl LivenessPoller {
    /// Create a poller using `default_interval` until the coordinator
    /// supplies one
    pub fn new(coordinator: Arc<dyn Coordinator>, default_interval: Duration) -> Self {
        Self {
            coordinator,
            default_interval,
            active: DashSet::new(),
        }
    }

    /// Whether a worker is polling for `cluster_id`
    pub fn is_active(&self, cluster_id: &str) -> bool {
        self.active.contains(cluster_id)
    }

    /// Start polling unless a worker already runs for the cluster
    pub fn start(
        self: &Arc<Self>,
        cluster_id: &str,
        headers: RegistrationHeaders,
        cancel: CancellationToken,
    ) -> bool {
        if !self.active.insert(cluster_id.to_string()) {
            return false;
        }
        let poller = self.clone();
        let cluster_id = cluster_id.to_string();
        tokio::spawn(async move {
            poller.run(&cluster_id, headers, cancel).await;
            poller.active.remove(&cluster_id);
        });
        true
    }

    async fn run(&self, cluster_id: &str, headers: RegistrationHeaders, cancel: CancellationToken) {
        let mut interval = self.default_interval;
        info!(cluster_id = %cluster_id, interval_secs = interval.as_secs(), "Starting liveness poll");

        loop {
            let poll = tokio::select! {
                _ = cancel.cancelled() => break,
                poll = self.coordinator.connect_config(&headers) => poll,
            };

            match poll {
                Ok(Some(config)) => {
                    if let Some(next) = config.interval() {
                        if next != interval {
                            debug!(
                                cluster_id = %cluster_id,
                                interval_secs = next.as_secs(),
                                "Coordinator changed poll interval"
                            );
                            interval = next;
                        }
                    }
                }
                Ok(None) => debug!(cluster_id = %cluster_id, "Connect config not found yet"),
                Err(e) => warn!(
                    cluster_id = %cluster_id,
                    status = ?e.status(),
                    error = %e,
                    "Liveness poll failed"
                ),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        debug!(cluster_id = %cluster_id, "Liveness poll stopped");
    }
}

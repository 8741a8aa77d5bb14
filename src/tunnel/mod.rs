//! Tunnel session manager
//!
//! Every cluster holds up to two outbound sessions to the coordinator:
//!
//! - **registration**: announces the backend's address and credentials with
//!   the registration token. Gives up after three failed attempts in a row.
//! - **agent**: authenticates with the backend's identity token and carries
//!   coordinator traffic into the backend. Retries until cancelled.
//!
//! Both share one reconnect loop. Each `(cluster, role)` pair is driven by a
//! single worker; starting a session that is already attempting or connected
//! is a no-op. Session state for each role lives in its own [`SessionTable`].

pub mod dial;
pub mod protocol;
pub mod session;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendApi, BackendEndpoint, BackendProvisioner};
use crate::coordinator::{Coordinator, RegistrationHeaders};
use crate::poller::LivenessPoller;
use crate::retry::Backoff;
use crate::{Error, Result};

pub use dial::{DialDecision, DialFilter};
pub use session::WebSocketDialer;

/// Coordinator path for the registration role
pub const REGISTRATION_PATH: &str = "/v3/connect/register";

/// Coordinator path for the agent role
pub const AGENT_PATH: &str = "/v3/connect";

/// Prefix identifying agent-role credentials
pub const AGENT_TOKEN_PREFIX: &str = "stv-cluster-";

/// Consecutive failures after which the registration role gives up
pub const REGISTRATION_MAX_ATTEMPTS: u32 = 3;

/// Which of the two sessions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelRole {
    /// One-time announcement of the cluster's connection parameters
    Registration,
    /// Long-lived session carrying coordinator traffic
    Agent,
}

impl TunnelRole {
    /// Coordinator path dialled for this role
    pub fn path(&self) -> &'static str {
        match self {
            TunnelRole::Registration => REGISTRATION_PATH,
            TunnelRole::Agent => AGENT_PATH,
        }
    }

    /// Attempt limit, `None` for unbounded
    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            TunnelRole::Registration => Some(REGISTRATION_MAX_ATTEMPTS),
            TunnelRole::Agent => None,
        }
    }

    /// Name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelRole::Registration => "registration",
            TunnelRole::Agent => "agent",
        }
    }
}

impl fmt::Display for TunnelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of one session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No worker running
    Idle,
    /// Worker running, not connected
    Attempting,
    /// Coordinator accepted the session
    Connected,
    /// Registration gave up
    Abandoned,
}

/// Point-in-time view of one session
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Connection state
    pub state: ConnectionState,
    /// Failed attempts since the last successful connect
    pub attempt_count: u32,
    /// Delay before the next attempt, in milliseconds
    pub backoff_ms: u64,
    /// `proto:address` destinations the session may dial
    pub allowed_destinations: Vec<String>,
}

#[derive(Debug)]
struct SessionEntry {
    state: ConnectionState,
    attempt_count: u32,
    backoff: Backoff,
    allowed_destinations: Vec<String>,
}

/// Session state for one role, keyed by cluster ID
#[derive(Debug, Default)]
pub struct SessionTable {
    entries: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session for a new worker
    ///
    /// Returns `false` when a worker is already attempting or connected.
    pub fn try_begin(&self, cluster_id: &str, allowed_destinations: Vec<String>) -> bool {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(cluster_id) {
            if matches!(
                entry.state,
                ConnectionState::Attempting | ConnectionState::Connected
            ) {
                return false;
            }
        }
        entries.insert(
            cluster_id.to_string(),
            SessionEntry {
                state: ConnectionState::Attempting,
                attempt_count: 0,
                backoff: Backoff::tunnel(),
                allowed_destinations,
            },
        );
        true
    }

    /// Record a successful connect, resetting attempts and backoff
    pub fn mark_connected(&self, cluster_id: &str) {
        if let Some(entry) = self.entries.lock().get_mut(cluster_id) {
            entry.state = ConnectionState::Connected;
            entry.attempt_count = 0;
            entry.backoff.reset();
        }
    }

    /// Record a failed or terminated session
    ///
    /// Returns the attempt number and the delay to sleep before the next one,
    /// or `None` if the entry has been removed.
    pub fn record_failure(&self, cluster_id: &str) -> Option<(u32, Duration)> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(cluster_id)?;
        entry.state = ConnectionState::Attempting;
        entry.attempt_count += 1;
        Some((entry.attempt_count, entry.backoff.next_delay()))
    }

    /// Give up on the session and clear its counters
    pub fn abandon(&self, cluster_id: &str) {
        if let Some(entry) = self.entries.lock().get_mut(cluster_id) {
            entry.state = ConnectionState::Abandoned;
            entry.attempt_count = 0;
            entry.backoff.reset();
        }
    }

    /// Drop the session entirely
    pub fn remove(&self, cluster_id: &str) {
        self.entries.lock().remove(cluster_id);
    }

    /// Current state, `Idle` when unknown
    pub fn state(&self, cluster_id: &str) -> ConnectionState {
        self.entries
            .lock()
            .get(cluster_id)
            .map(|e| e.state)
            .unwrap_or(ConnectionState::Idle)
    }

    /// Snapshot of one session
    pub fn info(&self, cluster_id: &str) -> Option<SessionInfo> {
        self.entries.lock().get(cluster_id).map(|e| SessionInfo {
            state: e.state,
            attempt_count: e.attempt_count,
            backoff_ms: e.backoff.current().as_millis() as u64,
            allowed_destinations: e.allowed_destinations.clone(),
        })
    }

    /// Number of sessions in `state`
    pub fn count(&self, state: ConnectionState) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|e| e.state == state)
            .count()
    }
}

/// Cluster a session is opened for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Coordinator-assigned cluster ID
    pub cluster_id: String,
    /// Backend name
    pub local_name: String,
    /// `host:port` of the backend
    pub backend_address: String,
}

/// Everything a [`TunnelDialer`] needs to open one session
#[derive(Clone, Debug)]
pub struct DialRequest {
    /// Cluster the session belongs to
    pub cluster_id: String,
    /// Session role
    pub role: TunnelRole,
    /// `ws://` or `wss://` URL of the tunnel endpoint
    pub url: String,
    /// Handshake headers
    pub headers: Vec<(String, String)>,
    /// Allow-list applied to every dial carried by the session
    pub filter: DialFilter,
    /// Cancels the session
    pub cancel: CancellationToken,
}

/// A running session; resolves when it terminates
pub type SessionFuture = BoxFuture<'static, Result<()>>;

/// Opens tunnel sessions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    /// Complete the handshake and return the running session
    ///
    /// Resolving `Ok` means the coordinator accepted the session.
    async fn connect(&self, request: DialRequest) -> Result<SessionFuture>;
}

/// Tunnel endpoint URLs and the probe address
#[derive(Clone, Debug)]
pub struct TunnelSettings {
    /// URL for [`TunnelRole::Registration`]
    pub registration_url: String,
    /// URL for [`TunnelRole::Agent`]
    pub agent_url: String,
    /// Coordinator liveness probe address
    pub probe_address: String,
}

impl TunnelSettings {
    fn url(&self, role: TunnelRole) -> &str {
        match role {
            TunnelRole::Registration => &self.registration_url,
            TunnelRole::Agent => &self.agent_url,
        }
    }
}

/// Owns both session tables and the per-session workers
pub struct TunnelManager {
    settings: TunnelSettings,
    registration: SessionTable,
    agent: SessionTable,
    coordinator: Arc<dyn Coordinator>,
    provisioner: Arc<dyn BackendProvisioner>,
    backend: Arc<dyn BackendApi>,
    dialer: Arc<dyn TunnelDialer>,
    poller: Arc<LivenessPoller>,
}

impl TunnelManager {
    /// Create a manager
    pub fn new(
        settings: TunnelSettings,
        coordinator: Arc<dyn Coordinator>,
        provisioner: Arc<dyn BackendProvisioner>,
        backend: Arc<dyn BackendApi>,
        dialer: Arc<dyn TunnelDialer>,
        poller: Arc<LivenessPoller>,
    ) -> Self {
        Self {
            settings,
            registration: SessionTable::new(),
            agent: SessionTable::new(),
            coordinator,
            provisioner,
            backend,
            dialer,
            poller,
        }
    }

    fn table(&self, role: TunnelRole) -> &SessionTable {
        match role {
            TunnelRole::Registration => &self.registration,
            TunnelRole::Agent => &self.agent,
        }
    }

    /// Start the registration session for a cluster
    pub fn start_registration(
        self: &Arc<Self>,
        target: TunnelTarget,
        cancel: CancellationToken,
    ) -> bool {
        self.start(TunnelRole::Registration, target, cancel)
    }

    /// Start a session worker unless one is already running
    ///
    /// Returns `true` when a new worker was spawned.
    pub fn start(
        self: &Arc<Self>,
        role: TunnelRole,
        target: TunnelTarget,
        cancel: CancellationToken,
    ) -> bool {
        let filter = DialFilter::new(&target.backend_address, &self.settings.probe_address);
        if !self
            .table(role)
            .try_begin(&target.cluster_id, filter.allowed_destinations())
        {
            debug!(cluster_id = %target.cluster_id, role = %role, "Tunnel already running");
            return false;
        }

        info!(
            cluster_id = %target.cluster_id,
            role = %role,
            allowed = %filter,
            "Starting tunnel"
        );
        let manager = self.clone();
        tokio::spawn(async move { manager.run(role, target, filter, cancel).await });
        true
    }

    /// Connection state of one session
    pub fn state(&self, role: TunnelRole, cluster_id: &str) -> ConnectionState {
        self.table(role).state(cluster_id)
    }

    /// Snapshot of one session
    pub fn session(&self, role: TunnelRole, cluster_id: &str) -> Option<SessionInfo> {
        self.table(role).info(cluster_id)
    }

    /// Number of sessions of `role` in `state`
    pub fn count(&self, role: TunnelRole, state: ConnectionState) -> usize {
        self.table(role).count(state)
    }

    /// Drop both sessions' bookkeeping for a cluster
    pub fn forget(&self, cluster_id: &str) {
        self.registration.remove(cluster_id);
        self.agent.remove(cluster_id);
    }

    async fn credentials(
        &self,
        role: TunnelRole,
        target: &TunnelTarget,
    ) -> Result<(Vec<(String, String)>, Option<RegistrationHeaders>)> {
        let id = &target.cluster_id;
        let credential = self
            .provisioner
            .fetch_credential(&target.local_name)
            .await
            .map_err(|e| Error::tunnel_auth(id, format!("backend credential: {}", e)))?;

        match role {
            TunnelRole::Registration => {
                let token = self
                    .coordinator
                    .registration_token(id)
                    .await
                    .map_err(|e| Error::tunnel_auth(id, format!("registration token: {}", e)))?;
                let headers = RegistrationHeaders::new(
                    &token,
                    &target.backend_address,
                    &credential.token,
                    &credential.ca_cert,
                )
                .map_err(|e| Error::tunnel_auth(id, e.to_string()))?;
                Ok((headers.pairs(), Some(headers)))
            }
            TunnelRole::Agent => {
                let endpoint = BackendEndpoint {
                    cluster_id: id.clone(),
                    address: target.backend_address.clone(),
                    credential,
                };
                let identity = self
                    .backend
                    .identity_token(&endpoint)
                    .await
                    .map_err(|e| Error::tunnel_auth(id, format!("identity token: {}", e)))?
                    .ok_or_else(|| Error::tunnel_auth(id, "identity secret missing"))?;
                let header = (
                    "Authorization".to_string(),
                    format!("Bearer {}{}", AGENT_TOKEN_PREFIX, identity),
                );
                Ok((vec![header], None))
            }
        }
    }

    async fn attempt(
        self: &Arc<Self>,
        role: TunnelRole,
        target: &TunnelTarget,
        filter: &DialFilter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (headers, registration) = self.credentials(role, target).await?;
        let session = self
            .dialer
            .connect(DialRequest {
                cluster_id: target.cluster_id.clone(),
                role,
                url: self.settings.url(role).to_string(),
                headers,
                filter: filter.clone(),
                cancel: cancel.clone(),
            })
            .await?;

        self.table(role).mark_connected(&target.cluster_id);
        info!(cluster_id = %target.cluster_id, role = %role, "Tunnel connected");

        if role == TunnelRole::Registration {
            self.start(TunnelRole::Agent, target.clone(), cancel.clone());
            if let Some(headers) = registration {
                self.poller
                    .start(&target.cluster_id, headers, cancel.clone());
            }
        }

        session.await
    }

    async fn run(
        self: Arc<Self>,
        role: TunnelRole,
        target: TunnelTarget,
        filter: DialFilter,
        cancel: CancellationToken,
    ) {
        let id = target.cluster_id.clone();
        let table = self.table(role);

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.attempt(role, &target, &filter, &cancel) => outcome,
            };
            if cancel.is_cancelled() {
                break;
            }

            let reason = match outcome {
                Ok(()) => "session closed".to_string(),
                Err(e) => e.to_string(),
            };
            let Some((attempt, delay)) = table.record_failure(&id) else {
                debug!(cluster_id = %id, role = %role, "Tunnel entry removed, stopping");
                return;
            };

            if role.max_attempts().is_some_and(|max| attempt >= max) {
                table.abandon(&id);
                warn!(
                    cluster_id = %id,
                    role = %role,
                    attempt,
                    error = %reason,
                    "Tunnel abandoned after repeated failures"
                );
                return;
            }

            warn!(
                cluster_id = %id,
                role = %role,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Tunnel attempt failed, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        table.remove(&id);
        debug!(cluster_id = %id, role = %role, "Tunnel stopped");
    }
}

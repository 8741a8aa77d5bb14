//! Scale agent - simulates fleets of downstream clusters for scale testing
//!
//! Each simulated cluster gets a locally addressable API backend, is imported
//! into the coordinator, walks through the onboarding steps, and then holds two
//! reverse tunnels open so the coordinator can reach the backend exactly as it
//! would a real downstream cluster.
//!
//! # Architecture
//!
//! - Cluster lifecycle requests arrive on the HTTP control surface
//! - The registry records each cluster and allocates its backend port
//! - An onboarding worker drives the cluster to `ready` or `failed`
//! - The tunnel manager opens the registration tunnel, then the agent tunnel
//!   and liveness poller once registration connects
//! - The registry is snapshotted to disk and restored on restart
//!
//! # Modules
//!
//! - [`allocator`] - Port and backend name allocation
//! - [`registry`] - Cluster records and status transitions
//! - [`backend`] - Backend provisioner contract and backend API client
//! - [`coordinator`] - Coordinator HTTP client
//! - [`onboarding`] - Per-cluster onboarding state machine
//! - [`tunnel`] - Registration and agent reverse tunnels
//! - [`poller`] - Liveness/config poller
//! - [`snapshot`] - Registry persistence
//! - [`agent`] - Process-level wiring and per-cluster cancellation
//! - [`server`] - HTTP control surface
//! - [`config`] - Configuration loading
//! - [`telemetry`] - Logging initialisation
//! - [`retry`] - Backoff schedules
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod agent;
pub mod allocator;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod onboarding;
pub mod poller;
pub mod registry;
pub mod retry;
pub mod server;
pub mod snapshot;
pub mod telemetry;
pub mod tunnel;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port for the HTTP control surface
pub const DEFAULT_LISTEN_PORT: u16 = 9090;

/// Default first candidate port for backend allocation
pub const DEFAULT_BASE_PORT: u16 = 8001;

/// Default distance between candidate backend ports
pub const DEFAULT_PORT_STEP: u16 = 10;

/// Default number of candidate ports scanned before giving up
pub const DEFAULT_PORT_SCAN_LIMIT: u32 = 1000;

/// Address the coordinator dials through the tunnel for its own health checks
pub const DEFAULT_PROBE_ADDRESS: &str = "10.43.0.1:443";

/// Cluster name reserved for the backend template
pub const RESERVED_CLUSTER_NAME: &str = "template";

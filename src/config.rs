//! Agent configuration stored at `~/.scale-agent/config.yaml`
//!
//! The file is YAML. Keys are snake_case; the legacy `RancherURL`,
//! `BearerToken`, `ListenPort` and `LogLevel` spellings are accepted as
//! aliases so existing configs keep working. Command line flags override
//! file values (see [`ConfigOverrides`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".scale-agent";
const CONFIG_FILE_NAME: &str = "config.yaml";
const STATE_DIR_NAME: &str = "state";
const KWOK_CLUSTERS_DIR: &str = ".kwok/clusters";

/// Output format for log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Full agent configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the coordinator (e.g. `https://rancher.example.com`)
    #[serde(alias = "RancherURL")]
    pub coordinator_url: String,
    /// API bearer token used for coordinator management calls
    #[serde(alias = "BearerToken")]
    pub bearer_token: String,
    /// Port for the HTTP control surface
    #[serde(default = "default_listen_port", alias = "ListenPort")]
    pub listen_port: u16,
    /// Log level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level", alias = "LogLevel")]
    pub log_level: String,
    /// Log line format
    #[serde(default)]
    pub log_format: LogFormat,
    /// First candidate backend port
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Distance between candidate backend ports
    #[serde(default = "default_port_step")]
    pub port_step: u16,
    /// Number of candidates scanned before allocation gives up
    #[serde(default = "default_port_scan_limit")]
    pub port_scan_limit: u32,
    /// Directory holding the registry snapshot
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory where kwokctl keeps per-backend state
    #[serde(default = "default_kwok_clusters_dir")]
    pub kwok_clusters_dir: PathBuf,
    /// Seconds between periodic snapshots
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Seconds between orphan sweeps (0 disables the periodic sweep)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Upper bound on backend provisioning plus readiness
    #[serde(default = "default_provision_timeout_secs")]
    pub provision_timeout_secs: u64,
    /// Interval between backend readiness checks
    #[serde(default = "default_ready_poll_interval_secs")]
    pub ready_poll_interval_secs: u64,
    /// Upper bound on waiting for the identity secret
    #[serde(default = "default_identity_timeout_secs")]
    pub identity_timeout_secs: u64,
    /// Interval between identity secret checks
    #[serde(default = "default_identity_poll_interval_secs")]
    pub identity_poll_interval_secs: u64,
    /// Address the coordinator dials for its own liveness probes
    #[serde(default = "default_probe_address")]
    pub probe_address: String,
    /// Liveness poll interval when the coordinator does not supply one
    #[serde(default = "default_poll_interval_secs")]
    pub default_poll_interval_secs: u64,
    /// Path to the kwokctl binary
    #[serde(default = "default_kwokctl_path")]
    pub kwokctl_path: String,
    /// Path to the kubectl binary
    #[serde(default = "default_kubectl_path")]
    pub kubectl_path: String,
    /// PEM bundle trusted for coordinator TLS in addition to web roots
    #[serde(default)]
    pub coordinator_ca_path: Option<PathBuf>,
    /// Skip coordinator certificate verification
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

fn default_listen_port() -> u16 {
    crate::DEFAULT_LISTEN_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_port() -> u16 {
    crate::DEFAULT_BASE_PORT
}

fn default_port_step() -> u16 {
    crate::DEFAULT_PORT_STEP
}

fn default_port_scan_limit() -> u32 {
    crate::DEFAULT_PORT_SCAN_LIMIT
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_state_dir() -> PathBuf {
    home_dir().join(CONFIG_DIR_NAME).join(STATE_DIR_NAME)
}

fn default_kwok_clusters_dir() -> PathBuf {
    home_dir().join(KWOK_CLUSTERS_DIR)
}

fn default_snapshot_interval_secs() -> u64 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_provision_timeout_secs() -> u64 {
    120
}

fn default_ready_poll_interval_secs() -> u64 {
    5
}

fn default_identity_timeout_secs() -> u64 {
    180
}

fn default_identity_poll_interval_secs() -> u64 {
    5
}

fn default_probe_address() -> String {
    crate::DEFAULT_PROBE_ADDRESS.to_string()
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_kwokctl_path() -> String {
    "kwokctl".to_string()
}

fn default_kubectl_path() -> String {
    "kubectl".to_string()
}

/// Returns `~/.scale-agent/config.yaml`
pub fn default_config_path() -> PathBuf {
    home_dir().join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Values supplied on the command line, applied over the file
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// `--listen-port`
    pub listen_port: Option<u16>,
    /// `--log-level`
    pub log_level: Option<String>,
    /// `--state-dir`
    pub state_dir: Option<PathBuf>,
}

impl AgentConfig {
    /// Parse a config from YAML text and validate it
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: AgentConfig = serde_yaml::from_str(text)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load, override and validate the config file at `path`
    pub fn load(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let mut config: AgentConfig = serde_yaml::from_str(&text)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Apply command line overrides
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(port) = overrides.listen_port {
            self.listen_port = port;
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        if let Some(dir) = overrides.state_dir {
            self.state_dir = dir;
        }
    }

    /// Reject configurations the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.bearer_token.trim().is_empty() {
            return Err(Error::config("bearer_token must not be empty"));
        }

        let url = self.coordinator()?;
        if url.host_str().is_none() {
            return Err(Error::config("coordinator_url must include a host"));
        }

        if self.port_step == 0 {
            return Err(Error::config("port_step must be greater than zero"));
        }
        if self.port_scan_limit == 0 {
            return Err(Error::config("port_scan_limit must be greater than zero"));
        }
        let last = u32::from(self.port_step)
            .checked_mul(self.port_scan_limit - 1)
            .and_then(|span| span.checked_add(u32::from(self.base_port)))
            .filter(|last| *last <= u32::from(u16::MAX));
        match last {
            Some(_) if self.base_port != 0 => {}
            _ => {
                return Err(Error::config(format!(
                    "port range starting at {} with {} candidates every {} does not fit in 1..=65535",
                    self.base_port, self.port_scan_limit, self.port_step
                )));
            }
        }

        for (name, value) in [
            ("ready_poll_interval_secs", self.ready_poll_interval_secs),
            ("identity_poll_interval_secs", self.identity_poll_interval_secs),
            ("default_poll_interval_secs", self.default_poll_interval_secs),
            ("snapshot_interval_secs", self.snapshot_interval_secs),
        ] {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }

        if !self.probe_address.contains(':') {
            return Err(Error::config("probe_address must be host:port"));
        }

        Ok(())
    }

    /// Parsed coordinator base URL
    pub fn coordinator(&self) -> Result<Url> {
        let url = Url::parse(self.coordinator_url.trim_end_matches('/'))
            .map_err(|e| Error::config(format!("invalid coordinator_url: {}", e)))?;
        match url.scheme() {
            "https" | "http" => Ok(url),
            other => Err(Error::config(format!(
                "coordinator_url must be http or https, got {}",
                other
            ))),
        }
    }

    /// WebSocket URL for a coordinator tunnel path
    pub fn tunnel_url(&self, path: &str) -> Result<String> {
        let url = self.coordinator()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        let host = url
            .host_str()
            .ok_or_else(|| Error::config("coordinator_url must include a host"))?;
        Ok(match url.port() {
            Some(port) => format!("{}://{}:{}{}", scheme, host, port, path),
            None => format!("{}://{}{}", scheme, host, path),
        })
    }

    /// Path of the registry snapshot file
    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join(crate::snapshot::SNAPSHOT_FILE_NAME)
    }

    /// Upper bound on backend provisioning plus readiness
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    /// Interval between backend readiness checks
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ready_poll_interval_secs)
    }

    /// Upper bound on waiting for the identity secret
    pub fn identity_timeout(&self) -> Duration {
        Duration::from_secs(self.identity_timeout_secs)
    }

    /// Interval between identity secret checks
    pub fn identity_poll_interval(&self) -> Duration {
        Duration::from_secs(self.identity_poll_interval_secs)
    }

    /// Liveness poll interval when the coordinator does not supply one
    pub fn default_poll_interval(&self) -> Duration {
        Duration::from_secs(self.default_poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
coordinator_url: https://rancher.example.com
bearer_token: token-abc:secret
"#;

    #[test]
    fn test_defaults_applied() {
        let config = AgentConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.listen_port, 9090);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.base_port, 8001);
        assert_eq!(config.port_step, 10);
        assert_eq!(config.probe_address, "10.43.0.1:443");
        assert_eq!(config.provision_timeout(), Duration::from_secs(120));
        assert_eq!(config.identity_timeout(), Duration::from_secs(180));
        assert!(config.coordinator_ca_path.is_none());
        assert!(!config.insecure_skip_tls_verify);
    }

    #[test]
    fn test_legacy_keys_accepted() {
        let yaml = r#"
RancherURL: https://rancher.example.com:8443
BearerToken: token-xyz
ListenPort: 9191
LogLevel: debug
"#;
        let config = AgentConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.coordinator_url, "https://rancher.example.com:8443");
        assert_eq!(config.bearer_token, "token-xyz");
        assert_eq!(config.listen_port, 9191);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_tunnel_url_uses_websocket_scheme() {
        let config = AgentConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(
            config.tunnel_url("/v3/connect/register").unwrap(),
            "wss://rancher.example.com/v3/connect/register"
        );

        let mut plain = config.clone();
        plain.coordinator_url = "http://127.0.0.1:8080/".to_string();
        assert_eq!(
            plain.tunnel_url("/v3/connect").unwrap(),
            "ws://127.0.0.1:8080/v3/connect"
        );
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config = AgentConfig::from_yaml(MINIMAL).unwrap();
        config.apply(ConfigOverrides {
            listen_port: Some(7000),
            log_level: Some("trace".to_string()),
            state_dir: Some(PathBuf::from("/tmp/agent-state")),
        });
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.log_level, "trace");
        assert_eq!(
            config.snapshot_path(),
            PathBuf::from("/tmp/agent-state").join(crate::snapshot::SNAPSHOT_FILE_NAME)
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases = [
            "coordinator_url: https://r.example.com\nbearer_token: ''\n",
            "coordinator_url: ftp://r.example.com\nbearer_token: t\n",
            "coordinator_url: https://r.example.com\nbearer_token: t\nport_step: 0\n",
            "coordinator_url: https://r.example.com\nbearer_token: t\nbase_port: 65000\n",
            "coordinator_url: https://r.example.com\nbearer_token: t\nprobe_address: nope\n",
        ];
        for yaml in cases {
            let err = AgentConfig::from_yaml(yaml).unwrap_err();
            assert!(matches!(err, Error::Config { .. }), "{yaml}: {err}");
        }
    }

    #[test]
    fn test_huge_scan_range_is_rejected_not_wrapped() {
        let yaml = "coordinator_url: https://r.example.com\nbearer_token: t\nport_step: 65535\nport_scan_limit: 4294967295\n";
        let err = AgentConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::Config { .. }), "{err}");
        assert!(err.to_string().contains("does not fit"), "{err}");
    }

    #[test]
    fn test_missing_required_key() {
        let err = AgentConfig::from_yaml("bearer_token: t\n").unwrap_err();
        assert!(err.to_string().contains("coordinator_url"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = AgentConfig::load(&path, ConfigOverrides::default()).unwrap();
        assert_eq!(config.coordinator_url, "https://rancher.example.com");

        let missing = AgentConfig::load(&dir.path().join("nope.yaml"), ConfigOverrides::default());
        assert!(matches!(missing, Err(Error::Config { .. })));
    }
}

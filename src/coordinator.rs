//! Coordinator HTTP client
//!
//! Management calls (cluster create/delete/list, registration tokens, the
//! import manifest) authenticate with the configured API bearer token. The
//! connect-config poll authenticates with the per-cluster tunnel headers, the
//! same ones the registration tunnel presents.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::{Error, Result};

/// Header carrying the registration credential
pub const TUNNEL_TOKEN_HEADER: &str = "X-API-Tunnel-Token";

/// Header carrying the base64 cluster parameter blob
pub const TUNNEL_PARAMS_HEADER: &str = "X-API-Tunnel-Params";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// `cluster` member of the tunnel parameter blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterParams {
    /// `host:port` the coordinator should dial through the tunnel
    pub address: String,
    /// Bearer token the coordinator presents to the backend
    pub token: String,
    /// Base64 of the backend CA PEM
    #[serde(rename = "caCert")]
    pub ca_cert: String,
}

#[derive(Serialize)]
struct ParamsEnvelope {
    cluster: ClusterParams,
}

/// Headers identifying a cluster's registration session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationHeaders {
    /// Registration credential
    pub token: String,
    /// Base64 JSON `{"cluster": {address, token, caCert}}`
    pub params: String,
}

impl RegistrationHeaders {
    /// Encode headers for a backend
    pub fn new(token: &str, address: &str, backend_token: &str, ca_pem: &str) -> Result<Self> {
        let engine = base64::engine::general_purpose::STANDARD;
        let envelope = ParamsEnvelope {
            cluster: ClusterParams {
                address: address.to_string(),
                token: backend_token.to_string(),
                ca_cert: engine.encode(ca_pem),
            },
        };
        let json = serde_json::to_vec(&envelope)?;
        Ok(Self {
            token: token.to_string(),
            params: engine.encode(json),
        })
    }

    /// Header name/value pairs
    pub fn pairs(&self) -> Vec<(String, String)> {
        vec![
            (TUNNEL_TOKEN_HEADER.to_string(), self.token.clone()),
            (TUNNEL_PARAMS_HEADER.to_string(), self.params.clone()),
        ]
    }
}

/// Configuration hints returned by the connect-config endpoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectConfig {
    /// Seconds between liveness polls
    #[serde(default, rename = "agentCheckInterval")]
    pub agent_check_interval: Option<u64>,
}

impl ConnectConfig {
    /// Poll interval, if the coordinator supplied a usable one
    pub fn interval(&self) -> Option<Duration> {
        self.agent_check_interval
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Calls the agent makes against the coordinator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create an imported cluster and return its ID
    async fn create_cluster(&self, name: &str) -> Result<String>;

    /// Delete a cluster (missing clusters are not an error)
    async fn delete_cluster(&self, cluster_id: &str) -> Result<()>;

    /// IDs of every cluster the coordinator knows about
    async fn list_cluster_ids(&self) -> Result<HashSet<String>>;

    /// Registration credential for a cluster, created on first use
    async fn registration_token(&self, cluster_id: &str) -> Result<String>;

    /// Drop any cached state for a cluster
    fn forget(&self, cluster_id: &str);

    /// Import manifest for a cluster
    async fn import_manifest(&self, cluster_id: &str, token: &str) -> Result<String>;

    /// Poll connect-config; `Ok(None)` when the coordinator answers 404
    async fn connect_config(&self, headers: &RegistrationHeaders) -> Result<Option<ConnectConfig>>;
}

/// [`Coordinator`] over reqwest
pub struct HttpCoordinator {
    base_url: String,
    bearer_token: String,
    client: reqwest::Client,
    tokens: DashMap<String, String>,
}

fn first_token(body: &Value) -> Option<String> {
    body.get("data")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|t| t.get("token").and_then(Value::as_str))
        .find(|t| !t.is_empty())
        .map(str::to_string)
}

impl HttpCoordinator {
    /// Build a client from the agent configuration
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let base = config.coordinator()?;
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if let Some(path) = &config.coordinator_ca_path {
            let pem = std::fs::read(path).map_err(|e| {
                Error::config(format!("failed to read {}: {}", path.display(), e))
            })?;
            let ca = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::config(format!("invalid coordinator CA: {}", e)))?;
            builder = builder.add_root_certificate(ca);
        }
        if config.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base.as_str().trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            client,
            tokens: DashMap::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| Error::coordinator(format!("GET {}: {}", path, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::coordinator_status(
                status.as_u16(),
                format!("GET {} returned {}: {}", path, status, body),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Error::coordinator(format!("GET {}: invalid JSON: {}", path, e)))
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<(StatusCode, Value)> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.bearer_token)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::coordinator(format!("POST {}: {}", path, e)))?;
        let status = response.status();
        let value = response.json().await.unwrap_or(Value::Null);
        Ok((status, value))
    }
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn create_cluster(&self, name: &str) -> Result<String> {
        let (status, body) = self
            .post_json("/v3/clusters", &json!({"type": "cluster", "name": name}))
            .await?;

        if status == StatusCode::CONFLICT {
            return Err(Error::already_exists(name));
        }
        if !status.is_success() {
            return Err(Error::coordinator_status(
                status.as_u16(),
                format!("cluster create returned {}: {}", status, body),
            ));
        }

        let id = body
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::coordinator("cluster create response missing id"))?;
        info!(name = %name, cluster_id = %id, "Cluster created on coordinator");
        Ok(id.to_string())
    }

    async fn delete_cluster(&self, cluster_id: &str) -> Result<()> {
        let path = format!("/v3/clusters/{}", cluster_id);
        let response = self
            .client
            .delete(self.url(&path))
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| Error::coordinator(format!("DELETE {}: {}", path, e)))?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(cluster_id = %cluster_id, status = %status, "Cluster deleted on coordinator");
            return Ok(());
        }
        Err(Error::coordinator_status(
            status.as_u16(),
            format!("DELETE {} returned {}", path, status),
        ))
    }

    async fn list_cluster_ids(&self) -> Result<HashSet<String>> {
        let body = self.get_json("/v3/clusters?limit=-1").await?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|c| c.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    async fn registration_token(&self, cluster_id: &str) -> Result<String> {
        if let Some(token) = self.tokens.get(cluster_id) {
            return Ok(token.clone());
        }

        let list_path = format!("/v3/clusters/{}/clusterregistrationtokens", cluster_id);
        let token = match first_token(&self.get_json(&list_path).await?) {
            Some(token) => token,
            None => {
                debug!(cluster_id = %cluster_id, "No registration token yet, creating one");
                let (status, body) = self
                    .post_json(
                        "/v3/clusterregistrationtokens",
                        &json!({"type": "clusterRegistrationToken", "clusterId": cluster_id}),
                    )
                    .await?;
                if !status.is_success() {
                    return Err(Error::coordinator_status(
                        status.as_u16(),
                        format!("registration token create returned {}", status),
                    ));
                }
                match body.get("token").and_then(Value::as_str).filter(|t| !t.is_empty()) {
                    Some(token) => token.to_string(),
                    None => first_token(&self.get_json(&list_path).await?).ok_or_else(|| {
                        Error::coordinator(format!(
                            "registration token for {} not issued yet",
                            cluster_id
                        ))
                    })?,
                }
            }
        };

        self.tokens.insert(cluster_id.to_string(), token.clone());
        Ok(token)
    }

    fn forget(&self, cluster_id: &str) {
        self.tokens.remove(cluster_id);
    }

    async fn import_manifest(&self, cluster_id: &str, token: &str) -> Result<String> {
        let path = format!("/v3/import/{}_{}.yaml", token, cluster_id);
        let response = self
            .client
            .get(self.url(&path))
            .send()
            .await
            .map_err(|e| Error::manifest_fetch(cluster_id, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::manifest_fetch(
                cluster_id,
                format!("import manifest returned {}", status),
            ));
        }
        let manifest = response
            .text()
            .await
            .map_err(|e| Error::manifest_fetch(cluster_id, e.to_string()))?;
        if manifest.trim().is_empty() {
            return Err(Error::manifest_fetch(cluster_id, "import manifest is empty"));
        }
        Ok(manifest)
    }

    async fn connect_config(&self, headers: &RegistrationHeaders) -> Result<Option<ConnectConfig>> {
        let mut request = self.client.get(self.url("/v3/connect/config"));
        for (name, value) in headers.pairs() {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::coordinator(format!("connect config: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::coordinator_status(
                status.as_u16(),
                format!("connect config returned {}", status),
            ));
        }
        let text = response
            .text()
            .await
            .map_err(|e| Error::coordinator(format!("connect config: {}", e)))?;
        if text.trim().is_empty() {
            return Ok(Some(ConnectConfig::default()));
        }
        Ok(Some(serde_json::from_str(&text)?))
    }
}

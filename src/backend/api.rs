//! HTTPS client for running backends

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{BackendApi, BackendEndpoint, IDENTITY_NAMESPACE, IDENTITY_SECRET_PREFIX};
use crate::{Error, Result};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Split a multi-document YAML manifest into objects
///
/// Empty documents are skipped and `kind: List` documents are flattened
/// into their items.
pub fn manifest_documents(manifest: &str) -> Result<Vec<Value>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        if value.get("kind").and_then(Value::as_str) == Some("List") {
            if let Some(items) = value.get("items").and_then(Value::as_array) {
                objects.extend(items.iter().cloned());
            }
            continue;
        }
        objects.push(value);
    }
    Ok(objects)
}

fn plural(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower == "endpoints" {
        return lower;
    }
    if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem.ends_with(['a', 'e', 'i', 'o', 'u']) {
            format!("{}s", lower)
        } else {
            format!("{}ies", stem)
        }
    } else {
        format!("{}s", lower)
    }
}

/// Collection URL path an object is created through
///
/// The object is treated as namespaced exactly when it carries
/// `metadata.namespace`.
pub fn object_collection_path(object: &Value) -> Result<String> {
    let api_version = object
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::validation("manifest object missing apiVersion"))?;
    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::validation("manifest object missing kind"))?;
    let namespace = object.pointer("/metadata/namespace").and_then(Value::as_str);

    let prefix = if api_version.contains('/') {
        format!("/apis/{}", api_version)
    } else {
        format!("/api/{}", api_version)
    };

    Ok(match namespace {
        Some(ns) => format!("{}/namespaces/{}/{}", prefix, ns, plural(kind)),
        None => format!("{}/{}", prefix, plural(kind)),
    })
}

/// Pull the identity token out of a `SecretList` response body
pub fn decode_identity_token(secrets: &Value) -> Result<Option<String>> {
    let items = match secrets.get("items").and_then(Value::as_array) {
        Some(items) => items,
        None => return Ok(None),
    };

    let secret = items.iter().find(|s| {
        s.pointer("/metadata/name")
            .and_then(Value::as_str)
            .is_some_and(|name| name.starts_with(IDENTITY_SECRET_PREFIX))
    });
    let encoded = match secret
        .and_then(|s| s.pointer("/data/token"))
        .and_then(Value::as_str)
    {
        Some(encoded) => encoded,
        None => return Ok(None),
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::serialization(format!("identity token is not base64: {}", e)))?;
    let token = String::from_utf8(bytes)
        .map_err(|e| Error::serialization(format!("identity token is not UTF-8: {}", e)))?;
    let token = token.trim().to_string();
    Ok((!token.is_empty()).then_some(token))
}

/// [`BackendApi`] over reqwest
///
/// Backends listen on loopback with certificates minted per backend, so the
/// client trusts the endpoint's own CA when one is supplied and otherwise
/// accepts the loopback certificate as-is.
#[derive(Clone, Debug, Default)]
pub struct HttpBackendApi;

impl HttpBackendApi {
    /// Create a new client factory
    pub fn new() -> Self {
        Self
    }

    fn client(&self, endpoint: &BackendEndpoint) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if endpoint.credential.ca_cert.trim().is_empty() {
            builder = builder.danger_accept_invalid_certs(true);
        } else {
            let ca = reqwest::Certificate::from_pem(endpoint.credential.ca_cert.as_bytes())
                .map_err(|e| {
                    Error::not_ready(&endpoint.cluster_id, format!("invalid backend CA: {}", e))
                })?;
            builder = builder.add_root_certificate(ca);
        }
        builder.build().map_err(|e| {
            Error::not_ready(
                &endpoint.cluster_id,
                format!("failed to build HTTP client: {}", e),
            )
        })
    }

    fn authorize(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: &BackendEndpoint,
    ) -> reqwest::RequestBuilder {
        if endpoint.credential.token.is_empty() {
            request
        } else {
            request.bearer_auth(&endpoint.credential.token)
        }
    }
}

#[async_trait]
impl BackendApi for HttpBackendApi {
    async fn apply_manifest(&self, endpoint: &BackendEndpoint, manifest: &str) -> Result<usize> {
        let cluster = endpoint.cluster_id.as_str();
        let objects = manifest_documents(manifest)
            .map_err(|e| Error::manifest_apply(cluster, format!("invalid manifest: {}", e)))?;
        let client = self
            .client(endpoint)
            .map_err(|e| Error::manifest_apply(cluster, e.to_string()))?;

        for object in &objects {
            let path = object_collection_path(object)
                .map_err(|e| Error::manifest_apply(cluster, e.to_string()))?;
            let kind = object.get("kind").and_then(Value::as_str).unwrap_or_default();
            let name = object
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .unwrap_or_default();

            let response = self
                .authorize(
                    client.post(format!("{}{}", endpoint.base_url(), path)),
                    endpoint,
                )
                .json(object)
                .send()
                .await
                .map_err(|e| Error::manifest_apply(cluster, format!("{}/{}: {}", kind, name, e)))?;

            let status = response.status();
            if status == StatusCode::CONFLICT {
                debug!(cluster_id = %cluster, kind, name, "Object already exists");
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::manifest_apply(
                    cluster,
                    format!("{}/{} rejected with {}: {}", kind, name, status, body),
                ));
            }
            debug!(cluster_id = %cluster, kind, name, "Applied object");
        }

        Ok(objects.len())
    }

    async fn identity_token(&self, endpoint: &BackendEndpoint) -> Result<Option<String>> {
        let client = self.client(endpoint)?;
        let url = format!(
            "{}/api/v1/namespaces/{}/secrets",
            endpoint.base_url(),
            IDENTITY_NAMESPACE
        );
        let response = self
            .authorize(client.get(url), endpoint)
            .send()
            .await
            .map_err(|e| Error::not_ready(&endpoint.cluster_id, e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            warn!(
                cluster_id = %endpoint.cluster_id,
                status = %response.status(),
                "Listing identity secrets failed"
            );
            return Ok(None);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::serialization(e.to_string()))?;
        decode_identity_token(&body)
    }

    async fn probe(&self, endpoint: &BackendEndpoint, path: &str) -> Result<u16> {
        let client = self.client(endpoint)?;
        let response = self
            .authorize(client.get(format!("{}{}", endpoint.base_url(), path)), endpoint)
            .send()
            .await
            .map_err(|e| Error::not_ready(&endpoint.cluster_id, e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_manifest_documents_splits_and_flattens() {
        let manifest = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: cattle-system
---
---
apiVersion: v1
kind: List
items:
- apiVersion: v1
  kind: ServiceAccount
  metadata:
    name: cattle
    namespace: cattle-system
- apiVersion: rbac.authorization.k8s.io/v1
  kind: ClusterRoleBinding
  metadata:
    name: cattle-admin-binding
"#;
        let objects = manifest_documents(manifest).unwrap();
        let kinds: Vec<&str> = objects
            .iter()
            .map(|o| o["kind"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["Namespace", "ServiceAccount", "ClusterRoleBinding"]);
    }

    #[test]
    fn test_collection_paths() {
        let cases = [
            (
                json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "cattle-system"}}),
                "/api/v1/namespaces",
            ),
            (
                json!({"apiVersion": "apps/v1", "kind": "Deployment",
                       "metadata": {"name": "cattle-cluster-agent", "namespace": "cattle-system"}}),
                "/apis/apps/v1/namespaces/cattle-system/deployments",
            ),
            (
                json!({"apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRoleBinding",
                       "metadata": {"name": "x"}}),
                "/apis/rbac.authorization.k8s.io/v1/clusterrolebindings",
            ),
            (
                json!({"apiVersion": "networking.k8s.io/v1", "kind": "Ingress",
                       "metadata": {"name": "x", "namespace": "n"}}),
                "/apis/networking.k8s.io/v1/namespaces/n/ingresses",
            ),
            (
                json!({"apiVersion": "policy/v1beta1", "kind": "PodSecurityPolicy", "metadata": {"name": "x"}}),
                "/apis/policy/v1beta1/podsecuritypolicies",
            ),
        ];
        for (object, expected) in cases {
            assert_eq!(object_collection_path(&object).unwrap(), expected);
        }
    }

    #[test]
    fn test_collection_path_requires_kind() {
        let err = object_collection_path(&json!({"apiVersion": "v1"})).unwrap_err();
        assert!(err.to_string().contains("kind"));
    }

    #[test]
    fn test_decode_identity_token() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("reg-token-123\n");
        let list = json!({
            "items": [
                {"metadata": {"name": "default-token-x"}, "data": {"token": "aWdub3Jl"}},
                {"metadata": {"name": "cattle-credentials-abc"}, "data": {"token": encoded}}
            ]
        });
        assert_eq!(
            decode_identity_token(&list).unwrap().as_deref(),
            Some("reg-token-123")
        );
    }

    #[test]
    fn test_decode_identity_token_absent() {
        assert_eq!(decode_identity_token(&json!({"items": []})).unwrap(), None);
        assert_eq!(decode_identity_token(&json!({})).unwrap(), None);

        let bad = json!({"items": [{"metadata": {"name": "cattle-credentials-a"},
                                    "data": {"token": "!!not base64!!"}}]});
        assert!(decode_identity_token(&bad).is_err());
    }
}

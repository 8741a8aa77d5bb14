//! HTTP control surface
//!
//! Routes:
//! - `GET /health` - liveness plus cluster and tunnel counts
//! - `POST /clusters` - create a cluster (`{"name": ...}`), onboarding runs async
//! - `GET /clusters` - cluster names
//! - `GET /clusters/{name}` - record plus tunnel state
//! - `DELETE /clusters/{name}` - delete a cluster and tear down its backend

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::agent::{ClusterView, ScaleAgent};
use crate::tunnel::{ConnectionState, TunnelManager, TunnelRole};
use crate::Error;

/// Error returned by handlers
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request body
    BadRequest(String),
    /// Error from the agent
    Agent(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Agent(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Agent(Error::Validation { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Agent(Error::AlreadyExists { .. }) => StatusCode::CONFLICT,
            ApiError::Agent(Error::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Agent(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::BadRequest(message) => message.clone(),
            ApiError::Agent(err) => err.to_string(),
        };
        if status.is_server_error() {
            let cluster = match &self {
                ApiError::Agent(err) => err.cluster(),
                ApiError::BadRequest(_) => None,
            };
            error!(status = %status, cluster = ?cluster, error = %message, "Request failed");
        }
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// `GET /health` response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `healthy` while the server answers
    pub status: String,
    /// Crate version
    pub version: String,
    /// Number of clusters, excluding the reserved template name
    pub clusters: usize,
    /// Tunnel sessions by state
    pub tunnels: TunnelCounts,
}

/// Tunnel session counts reported on `/health`
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCounts {
    /// Registration tunnels the coordinator accepted
    pub registration_connected: usize,
    /// Registration tunnels that gave up
    pub registration_abandoned: usize,
    /// Agent tunnels the coordinator accepted
    pub agent_connected: usize,
}

impl TunnelCounts {
    fn collect(tunnels: &TunnelManager) -> Self {
        Self {
            registration_connected: tunnels
                .count(TunnelRole::Registration, ConnectionState::Connected),
            registration_abandoned: tunnels
                .count(TunnelRole::Registration, ConnectionState::Abandoned),
            agent_connected: tunnels.count(TunnelRole::Agent, ConnectionState::Connected),
        }
    }
}

/// `POST /clusters` request
#[derive(Debug, Deserialize)]
pub struct CreateClusterRequest {
    /// Cluster name
    pub name: String,
}

/// `POST /clusters` and `DELETE /clusters/{name}` response
#[derive(Debug, Serialize, Deserialize)]
pub struct MutationResponse {
    /// Whether the request was accepted
    pub success: bool,
    /// Human-readable summary
    pub message: String,
    /// Coordinator-assigned cluster ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

/// `GET /clusters` response
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    /// Cluster names, sorted
    pub clusters: Vec<String>,
    /// Number of clusters
    pub count: usize,
}

async fn health(State(agent): State<Arc<ScaleAgent>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        clusters: agent.cluster_count(),
        tunnels: TunnelCounts::collect(agent.tunnels()),
    })
}

async fn create_cluster(
    State(agent): State<Arc<ScaleAgent>>,
    body: Result<Json<CreateClusterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MutationResponse>), ApiError> {
    let Json(request) = body?;
    debug!(name = %request.name, "Create cluster request received");

    let record = agent.create_cluster(&request.name).await?;
    info!(name = %record.name, cluster_id = %record.cluster_id, "Cluster accepted");

    Ok((
        StatusCode::CREATED,
        Json(MutationResponse {
            success: true,
            message: format!("cluster {} created, onboarding started", record.name),
            cluster_id: Some(record.cluster_id),
        }),
    ))
}

async fn list_clusters(State(agent): State<Arc<ScaleAgent>>) -> Json<ListResponse> {
    let clusters: Vec<String> = agent
        .registry()
        .list()
        .into_iter()
        .map(|r| r.name)
        .collect();
    Json(ListResponse {
        count: clusters.len(),
        clusters,
    })
}

async fn get_cluster(
    State(agent): State<Arc<ScaleAgent>>,
    Path(name): Path<String>,
) -> Result<Json<ClusterView>, ApiError> {
    agent
        .cluster_view(&name)
        .map(Json)
        .ok_or_else(|| Error::not_found(name).into())
}

async fn delete_cluster(
    State(agent): State<Arc<ScaleAgent>>,
    Path(name): Path<String>,
) -> Result<Json<MutationResponse>, ApiError> {
    let record = agent.delete_cluster(&name).await?;
    Ok(Json(MutationResponse {
        success: true,
        message: format!("cluster {} deleted", name),
        cluster_id: Some(record.cluster_id),
    }))
}

/// Build the control surface router
pub fn router(agent: Arc<ScaleAgent>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/clusters", get(list_clusters).post(create_cluster))
        .route("/clusters/{name}", get(get_cluster).delete(delete_cluster))
        .with_state(agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Collaborators;
    use crate::backend::{MockBackendApi, MockBackendProvisioner};
    use crate::config::AgentConfig;
    use crate::coordinator::MockCoordinator;
    use crate::tunnel::MockTunnelDialer;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashSet;
    use tower::ServiceExt;

    fn test_agent(
        dir: &std::path::Path,
        coordinator: MockCoordinator,
        provisioner: MockBackendProvisioner,
    ) -> Arc<ScaleAgent> {
        let config = AgentConfig::from_yaml(&format!(
            "coordinator_url: https://rancher.example.com\nbearer_token: token-abc\nstate_dir: {}\n",
            dir.display()
        ))
        .unwrap();
        ScaleAgent::new(
            config,
            Collaborators {
                coordinator: Arc::new(coordinator),
                provisioner: Arc::new(provisioner),
                backend: Arc::new(MockBackendApi::new()),
                dialer: Arc::new(MockTunnelDialer::new()),
            },
        )
        .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_clusters(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/clusters")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError::from(Error::validation("bad")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(Error::already_exists("c1")).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(Error::not_found("c1")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(Error::coordinator("down")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(Error::AllocationExhausted {
                base: 8001,
                scanned: 10
            })
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_health_counts_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path(), MockCoordinator::new(), MockBackendProvisioner::new());
        agent
            .registry()
            .create("c-1", "c1", &HashSet::new())
            .unwrap();

        let response = router(agent)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let health: HealthResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(health.clusters, 1);
        assert_eq!(health.tunnels, TunnelCounts::default());
    }

    /// Story: a create request walks through to 201, and the same name a
    /// second time conflicts
    #[tokio::test]
    async fn story_create_then_conflict() {
        let dir = tempfile::tempdir().unwrap();

        let mut coordinator = MockCoordinator::new();
        coordinator
            .expect_create_cluster()
            .times(1)
            .returning(|_| Ok("c-abc".to_string()));

        let mut provisioner = MockBackendProvisioner::new();
        provisioner.expect_inventory().returning(|| Ok(vec![]));
        provisioner
            .expect_provision()
            .returning(|name, _| Err(Error::provision_failed(name, "offline")));
        provisioner.expect_teardown().returning(|_| Ok(()));

        let agent = test_agent(dir.path(), coordinator, provisioner);
        let app = router(agent.clone());

        let response = app
            .clone()
            .oneshot(post_clusters(r#"{"name": "c1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["cluster_id"], "c-abc");

        let response = app.oneshot(post_clusters(r#"{"name": "c1"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("c1"));

        agent.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_agent(
            dir.path(),
            MockCoordinator::new(),
            MockBackendProvisioner::new(),
        ));

        for body in [r#"{"name": "template"}"#, r#"{"name": "Bad_Name"}"#, r#"{}"#, "not json"] {
            let response = app.clone().oneshot(post_clusters(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        }
    }

    #[tokio::test]
    async fn test_list_get_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path(), MockCoordinator::new(), MockBackendProvisioner::new());
        agent.registry().create("c-2", "bravo", &HashSet::new()).unwrap();
        agent.registry().create("c-1", "alpha", &HashSet::new()).unwrap();
        let app = router(agent);

        let response = app
            .clone()
            .oneshot(Request::get("/clusters").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let list: ListResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(list.clusters, vec!["alpha", "bravo"]);
        assert_eq!(list.count, 2);

        let response = app
            .clone()
            .oneshot(Request::get("/clusters/alpha").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view = body_json(response).await;
        assert_eq!(view["cluster_id"], "c-1");
        assert_eq!(view["status"], "allocating");
        assert_eq!(view["port"], 8011);
        assert!(view["registration_tunnel"].is_null());

        let response = app
            .clone()
            .oneshot(Request::get("/clusters/zulu").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::delete("/clusters/zulu")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

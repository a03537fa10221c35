//! Object-store REST API.
//!
//! The store the rest of the system treats as "the cluster" lives inside
//! the controller; this module serves it to the agents. Node updates and
//! status writes carry resource versions, and a stale write comes back as
//! 409 so the caller re-reads and retries.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lagoon_api::{ImageSync, Node, Secret};
use lagoon_cluster::{Cluster, ClusterError, MemoryCluster};
use lagoon_proto::reporter::REPORT_PATH;

use crate::noderef::NodeRefs;
use crate::reporter;

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<MemoryCluster>,
    pub node_refs: Arc<NodeRefs>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/nodes", get(list_nodes).post(register_node))
        .route("/v1/nodes/{name}", get(get_node).put(update_node))
        .route("/v1/imagesyncs", get(list_image_syncs))
        .route(
            "/v1/namespaces/{namespace}/imagesyncs",
            post(create_image_sync),
        )
        .route(
            "/v1/namespaces/{namespace}/imagesyncs/{name}",
            get(get_image_sync)
                .put(update_image_sync)
                .delete(delete_image_sync),
        )
        .route("/v1/namespaces/{namespace}/secrets", post(create_secret))
        .route("/v1/namespaces/{namespace}/secrets/{name}", get(get_secret))
        .route(REPORT_PATH, post(reporter::report))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn list_nodes(State(state): State<AppState>) -> Json<Vec<Node>> {
    Json(state.cluster.list_nodes().await)
}

async fn get_node(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    into_response(state.cluster.get_node(&name).await)
}

async fn register_node(State(state): State<AppState>, Json(node): Json<Node>) -> Response {
    into_response(state.cluster.register_node(node).await)
}

async fn update_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut node): Json<Node>,
) -> Response {
    node.name = name;
    into_response(state.cluster.update_node(node).await)
}

async fn list_image_syncs(State(state): State<AppState>) -> Response {
    into_response(state.cluster.list_image_syncs().await)
}

async fn create_image_sync(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Json(mut sync): Json<ImageSync>,
) -> Response {
    sync.namespace = namespace;
    match state.cluster.create_image_sync(sync).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_image_sync(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    into_response(state.cluster.get_image_sync(&namespace, &name).await)
}

async fn update_image_sync(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(mut sync): Json<ImageSync>,
) -> Response {
    sync.namespace = namespace;
    sync.name = name;
    into_response(state.cluster.update_image_sync(sync).await)
}

async fn delete_image_sync(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    match state.cluster.delete_image_sync(&namespace, &name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn create_secret(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Json(mut secret): Json<Secret>,
) -> Response {
    secret.namespace = namespace;
    match state.cluster.create_secret(secret).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_secret(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    into_response(state.cluster.get_secret(&namespace, &name).await)
}

fn into_response<T: serde::Serialize>(result: Result<T, ClusterError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: ClusterError) -> Response {
    let status = match &err {
        ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
        ClusterError::Conflict(_) | ClusterError::AlreadyExists(_) => StatusCode::CONFLICT,
        ClusterError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ClusterError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

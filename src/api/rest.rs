//! REST API Handlers
//!
//! Exposes the registry, the master controller and the node controller over
//! JSON. Each part is optional; a process mounts what it runs. Errors are
//! returned as [`ApiErrorResponse`] with the status of their [`ErrorCode`].
//!
//! [`ErrorCode`]: crate::error::ErrorCode

use super::types::{
    ApiErrorResponse, CapacityResponse, CreateVolumeRequest, Empty, HealthResponse,
    ListVolumesResponse, NodeCreateVolumeRequest, RegisterControllerRequest,
};
use crate::controller::{MasterController, NodeController};
use crate::error::Error;
use crate::registry::Registry;
use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

// =============================================================================
// Router
// =============================================================================

/// Services mounted by the router
#[derive(Clone, Default)]
pub struct ApiState {
    pub registry: Option<Arc<Registry>>,
    pub master: Option<Arc<MasterController>>,
    pub node: Option<Arc<NodeController>>,
}

/// Build the router for the configured services
pub fn router(state: ApiState) -> Router {
    let mut router = Router::new().route("/healthz", get(health_check));

    if let Some(registry) = state.registry {
        router = router.merge(
            Router::new()
                .route(
                    "/v1/registry/controllers",
                    post(register_controller).get(list_controllers),
                )
                .route(
                    "/v1/registry/controllers/:node_id",
                    delete(unregister_controller),
                )
                .with_state(registry),
        );
    }

    if let Some(master) = state.master {
        router = router.merge(
            Router::new()
                .route(
                    "/v1/controller/volumes",
                    post(master_create_volume).get(master_list_volumes),
                )
                .route("/v1/controller/volumes/:volume_id", delete(master_delete_volume))
                .route("/v1/controller/capacity/:node_id", get(master_node_capacity))
                .with_state(master),
        );
    }

    if let Some(node) = state.node {
        router = router.merge(
            Router::new()
                .route(
                    "/v1/node/volumes",
                    post(node_create_volume).get(node_list_volumes),
                )
                .route("/v1/node/volumes/:volume_id", delete(node_delete_volume))
                .route("/v1/node/capacity", get(node_capacity))
                .with_state(node),
        );
    }

    router.layer(TraceLayer::new_for_http())
}

/// Turn an error into a response carrying its code
pub fn error_response(err: &Error) -> Response {
    let code = err.code();
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected ({}): {}", code, err);
    }
    (status, Json(ApiErrorResponse::from(err))).into_response()
}

fn reply<T: serde::Serialize>(result: crate::error::Result<T>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(&e),
    }
}

fn bad_body(rejection: JsonRejection) -> Response {
    error_response(&Error::InvalidArgument(rejection.body_text()))
}

// =============================================================================
// Health
// =============================================================================

async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".into(),
    })
}

// =============================================================================
// Registry Handlers
// =============================================================================

async fn register_controller(
    State(registry): State<Arc<Registry>>,
    request: Result<Json<RegisterControllerRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_body(rejection),
    };
    info!(
        "RegisterController: node {} at {}",
        request.node_id, request.endpoint
    );
    reply(
        registry
            .register_controller(&request.node_id, &request.endpoint)
            .map(|()| Empty {}),
    )
}

async fn unregister_controller(
    State(registry): State<Arc<Registry>>,
    Path(node_id): Path<String>,
) -> Response {
    info!("UnregisterController: node {}", node_id);
    reply(registry.unregister_controller(&node_id).map(|()| Empty {}))
}

async fn list_controllers(State(registry): State<Arc<Registry>>) -> Response {
    reply(Ok(registry.nodes()))
}

// =============================================================================
// Master Controller Handlers
// =============================================================================

async fn master_create_volume(
    State(master): State<Arc<MasterController>>,
    request: Result<Json<CreateVolumeRequest>, JsonRejection>,
) -> Response {
    match request {
        Ok(Json(request)) => reply(master.create_volume(&request).await),
        Err(rejection) => bad_body(rejection),
    }
}

async fn master_delete_volume(
    State(master): State<Arc<MasterController>>,
    Path(volume_id): Path<String>,
) -> Response {
    reply(master.delete_volume(&volume_id).await.map(|()| Empty {}))
}

async fn master_list_volumes(State(master): State<Arc<MasterController>>) -> Response {
    reply(Ok(ListVolumesResponse {
        volumes: master.list_volumes(),
    }))
}

async fn master_node_capacity(
    State(master): State<Arc<MasterController>>,
    Path(node_id): Path<String>,
) -> Response {
    reply(
        master
            .node_capacity(&node_id)
            .await
            .map(|available_capacity| CapacityResponse { available_capacity }),
    )
}

// =============================================================================
// Node Controller Handlers
// =============================================================================

async fn node_create_volume(
    State(node): State<Arc<NodeController>>,
    request: Result<Json<NodeCreateVolumeRequest>, JsonRejection>,
) -> Response {
    match request {
        Ok(Json(request)) => reply(node.create_volume(&request).await),
        Err(rejection) => bad_body(rejection),
    }
}

async fn node_delete_volume(
    State(node): State<Arc<NodeController>>,
    Path(volume_id): Path<String>,
) -> Response {
    reply(node.delete_volume(&volume_id).await.map(|()| Empty {}))
}

async fn node_list_volumes(State(node): State<Arc<NodeController>>) -> Response {
    reply(Ok(ListVolumesResponse {
        volumes: node.list_volumes(),
    }))
}

async fn node_capacity(State(node): State<Arc<NodeController>>) -> Response {
    reply(
        node.get_capacity()
            .await
            .map(|available_capacity| CapacityResponse { available_capacity }),
    )
}

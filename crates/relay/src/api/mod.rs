mod capture;
mod presence;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{
    auth::{jwt::JwtAccessTokenService, middleware::require_bearer_auth},
    hub::LabHub,
};

pub use capture::CaptureResponse;
pub use presence::PresenceResponse;

/// Header carrying the shared secret for the capture endpoint.
pub const INGEST_TOKEN_HEADER: &str = "x-labsync-ingest-token";

#[derive(Clone)]
struct ApiState {
    hub: Arc<LabHub>,
    ingest_token: Option<Arc<str>>,
}

pub fn router(
    jwt_service: Arc<JwtAccessTokenService>,
    hub: Arc<LabHub>,
    ingest_token: Option<String>,
) -> Router {
    let state = ApiState { hub, ingest_token: ingest_token.map(Arc::from) };
    let auth_layer = middleware::from_fn_with_state(jwt_service, require_bearer_auth);

    Router::new()
        .route(
            "/v1/labs/{lab_id}/presence",
            get(presence::get_presence).route_layer(auth_layer),
        )
        .route("/v1/capture", post(capture::ingest_mutations))
        .with_state(state)
}

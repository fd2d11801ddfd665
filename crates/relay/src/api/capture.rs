use axum::{extract::State, http::HeaderMap, Json};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ApiState, INGEST_TOKEN_HEADER};
use crate::{
    capture::RawMutation,
    error::{ErrorCode, RelayError},
};

const MAX_BATCH: usize = 1_000;

#[derive(Debug, Deserialize)]
pub(super) struct CaptureRequest {
    mutations: Vec<RawMutation>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptureResponse {
    pub committed: usize,
    pub duplicates: usize,
    pub ignored: usize,
}

/// Change-feed delivery endpoint. Disabled unless an ingest token is configured.
pub(super) async fn ingest_mutations(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<CaptureRequest>,
) -> Result<Json<CaptureResponse>, RelayError> {
    let Some(expected) = state.ingest_token.as_deref() else {
        return Err(RelayError::from_code(ErrorCode::NotFound));
    };
    let presented = headers.get(INGEST_TOKEN_HEADER).and_then(|value| value.to_str().ok());
    if presented != Some(expected) {
        warn!("capture request with missing or wrong ingest token");
        return Err(RelayError::new(ErrorCode::AuthInvalidToken, "invalid ingest token"));
    }
    if request.mutations.len() > MAX_BATCH {
        return Err(RelayError::new(
            ErrorCode::ValidationFailed,
            format!("at most {MAX_BATCH} mutations per request"),
        ));
    }

    let report = state.hub.ingest(request.mutations).await;
    Ok(Json(CaptureResponse {
        committed: report.committed,
        duplicates: report.duplicates,
        ignored: report.ignored,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::CaptureResponse;
    use crate::api::{
        router,
        test_support::{seed, LAB, TEST_SECRET},
        INGEST_TOKEN_HEADER,
    };
    use crate::auth::jwt::JwtAccessTokenService;
    use crate::hub::{HubConfig, LabHub};

    async fn post_capture(
        hub: Arc<LabHub>,
        configured: Option<&str>,
        presented: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let jwt_service = Arc::new(
            JwtAccessTokenService::new(TEST_SECRET).expect("jwt service should initialize"),
        );
        let body = serde_json::json!({ "mutations": seed() }).to_string();
        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/v1/capture")
            .header("content-type", "application/json");
        if let Some(token) = presented {
            request = request.header(INGEST_TOKEN_HEADER, token);
        }
        let response = router(jwt_service, hub, configured.map(ToOwned::to_owned))
            .oneshot(request.body(Body::from(body)).expect("capture request should build"))
            .await
            .expect("capture request should succeed");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        (status, serde_json::from_slice(&bytes).expect("response body should be json"))
    }

    #[tokio::test]
    async fn capture_commits_and_reports_duplicates() {
        let hub = Arc::new(LabHub::in_memory(HubConfig::default()));

        let (status, body) = post_capture(hub.clone(), Some("secret"), Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
        let first: CaptureResponse = serde_json::from_value(body).unwrap();
        assert_eq!(first, CaptureResponse { committed: 2, duplicates: 0, ignored: 0 });

        let (_, body) = post_capture(hub.clone(), Some("secret"), Some("secret")).await;
        let second: CaptureResponse = serde_json::from_value(body).unwrap();
        assert_eq!(second, CaptureResponse { committed: 0, duplicates: 2, ignored: 0 });
        assert_eq!(hub.sequencer().head(LAB).await, 2);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let hub = Arc::new(LabHub::in_memory(HubConfig::default()));
        let (status, body) = post_capture(hub.clone(), Some("secret"), Some("guess")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "AUTH_INVALID_TOKEN");

        let (status, _) = post_capture(hub, Some("secret"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn capture_is_disabled_without_a_token() {
        let hub = Arc::new(LabHub::in_memory(HubConfig::default()));
        let (status, body) = post_capture(hub, None, Some("secret")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }
}

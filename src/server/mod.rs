//! Self-hostable remote cache server
//!
//! Implements the artifacts API used by the remote cache client:
//! - GET  /health
//! - GET  /v8/artifacts/status
//! - HEAD /v8/artifacts/{hash}
//! - GET  /v8/artifacts/{hash}
//! - PUT  /v8/artifacts/{hash}

pub mod store;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::cache::remote::ARTIFACT_DURATION_HEADER;
use crate::logging::{operations, status};
use store::{ArtifactStore, DEFAULT_TEAM};

/// Default maximum artifact size (512MB)
pub const DEFAULT_MAX_ARTIFACT_SIZE: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bearer token required on artifact routes
    pub token: Option<String>,
    pub max_artifact_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            token: None,
            max_artifact_size: DEFAULT_MAX_ARTIFACT_SIZE,
        }
    }
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn ArtifactStore>,
    token: Option<Arc<str>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeamQuery {
    team_id: Option<String>,
    slug: Option<String>,
}

impl TeamQuery {
    /// Storage namespace for the request; `None` when the name is unsafe
    fn namespace(&self) -> Option<String> {
        let team = self
            .team_id
            .as_deref()
            .or(self.slug.as_deref())
            .unwrap_or(DEFAULT_TEAM);

        let valid = !team.is_empty()
            && team
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| team.to_string())
    }
}

/// Build the router over `store`
pub fn router(store: Arc<dyn ArtifactStore>, config: ServerConfig) -> Router {
    let state = AppState {
        store,
        token: config.token.map(Arc::from),
    };
    let limit = usize::try_from(config.max_artifact_size).unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(health_handler))
        .route("/v8/artifacts/status", get(status_handler))
        .route(
            "/v8/artifacts/{hash}",
            get(get_artifact).head(head_artifact).put(put_artifact),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Remote cache server listening on http://{}", addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Check the bearer token when one is configured
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if provided == Some(expected.as_ref()) {
        Ok(())
    } else {
        warn!("Rejected request with missing or invalid token");
        Err((StatusCode::UNAUTHORIZED, "Unauthorized").into_response())
    }
}

/// Validate hash and team, returning the storage namespace
fn validate(hash: &str, query: &TeamQuery) -> Result<String, Response> {
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        warn!(hash = %hash, "Invalid hash format");
        return Err((StatusCode::BAD_REQUEST, "Invalid hash format").into_response());
    }

    query
        .namespace()
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "Invalid team").into_response())
}

async fn status_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    Json(serde_json::json!({ "status": "enabled" })).into_response()
}

async fn head_artifact(
    Path(hash): Path<String>,
    Query(query): Query<TeamQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let team = match validate(&hash, &query) {
        Ok(team) => team,
        Err(response) => return response,
    };

    match state.store.size(&team, &hash) {
        Ok(Some(size)) => {
            debug!(operation = operations::EXISTS, status = status::HIT, hash = %hash, "artifact exists");
            (StatusCode::OK, [(header::CONTENT_LENGTH, size.to_string())]).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(hash = %hash, error = %e, "Storage error");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_artifact(
    Path(hash): Path<String>,
    Query(query): Query<TeamQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let team = match validate(&hash, &query) {
        Ok(team) => team,
        Err(response) => return response,
    };

    match state.store.get(&team, &hash) {
        Ok(Some(artifact)) => {
            info!(
                operation = operations::FETCH,
                status = status::HIT,
                hash = %hash,
                size_bytes = artifact.data.len(),
                "cache hit"
            );

            let mut response = (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                artifact.data,
            )
                .into_response();

            if let Some(duration) = artifact.duration_ms {
                if let Ok(value) = HeaderValue::from_str(&duration.to_string()) {
                    response
                        .headers_mut()
                        .insert(ARTIFACT_DURATION_HEADER, value);
                }
            }
            response
        }
        Ok(None) => {
            info!(operation = operations::FETCH, status = status::MISS, hash = %hash, "cache miss");
            (StatusCode::NOT_FOUND, "Not found").into_response()
        }
        Err(e) => {
            warn!(hash = %hash, error = %e, "Storage error");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
    }
}

async fn put_artifact(
    Path(hash): Path<String>,
    Query(query): Query<TeamQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authorize(&state, &headers) {
        return response;
    }
    let team = match validate(&hash, &query) {
        Ok(team) => team,
        Err(response) => return response,
    };

    let duration_ms = headers
        .get(ARTIFACT_DURATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let store = state.store.clone();
    let size = body.len();
    let key = hash.clone();
    let result =
        tokio::task::spawn_blocking(move || store.put(&team, &key, &body, duration_ms)).await;

    match result {
        Ok(Ok(())) => {
            info!(
                operation = operations::PUT,
                status = status::SUCCESS,
                hash = %hash,
                size_bytes = size,
                "artifact stored"
            );
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "urls": [hash] })),
            )
                .into_response()
        }
        Ok(Err(e)) => {
            warn!(hash = %hash, error = %e, "Storage error");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
        Err(e) => {
            warn!(hash = %hash, error = %e, "Storage task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use store::FilesystemStore;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(temp: &TempDir, config: ServerConfig) -> Router {
        let store = Arc::new(FilesystemStore::new(temp.path()).unwrap());
        router(store, config)
    }

    fn request(method: Method, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_health() {
        let temp = TempDir::new().unwrap();
        let response = app(&temp, ServerConfig::default())
            .oneshot(request(Method::GET, "/health", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_put_then_get_artifact() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp, ServerConfig::default());

        let put = Request::builder()
            .method(Method::PUT)
            .uri("/v8/artifacts/abcdef0123456789")
            .header(ARTIFACT_DURATION_HEADER, "2500")
            .body(Body::from("artifact-bytes"))
            .unwrap();
        let response = app.clone().oneshot(put).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .clone()
            .oneshot(request(Method::HEAD, "/v8/artifacts/abcdef0123456789", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request(Method::GET, "/v8/artifacts/abcdef0123456789", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(ARTIFACT_DURATION_HEADER).unwrap(),
            "2500"
        );
        assert_eq!(body_bytes(response).await, b"artifact-bytes");
    }

    #[tokio::test]
    async fn test_missing_artifact_is_404() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp, ServerConfig::default());

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/v8/artifacts/ffff", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request(Method::HEAD, "/v8/artifacts/ffff", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_hash_is_400() {
        let temp = TempDir::new().unwrap();
        let response = app(&temp, ServerConfig::default())
            .oneshot(request(Method::GET, "/v8/artifacts/not-a-hash", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_token_required() {
        let temp = TempDir::new().unwrap();
        let app = app(
            &temp,
            ServerConfig {
                token: Some("secret".to_string()),
                ..Default::default()
            },
        );

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/v8/artifacts/status", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let authorized = Request::builder()
            .uri("/v8/artifacts/status")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(authorized).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["status"], "enabled");
    }

    #[tokio::test]
    async fn test_team_namespaces() {
        let temp = TempDir::new().unwrap();
        let app = app(&temp, ServerConfig::default());

        let put = request(Method::PUT, "/v8/artifacts/abcd?slug=acme", Body::from("a"));
        assert_eq!(app.clone().oneshot(put).await.unwrap().status(), StatusCode::ACCEPTED);

        let other_team = request(Method::GET, "/v8/artifacts/abcd?teamId=team_other", Body::empty());
        assert_eq!(
            app.clone().oneshot(other_team).await.unwrap().status(),
            StatusCode::NOT_FOUND
        );

        let bad_team = request(Method::GET, "/v8/artifacts/abcd?slug=../etc", Body::empty());
        assert_eq!(
            app.oneshot(bad_team).await.unwrap().status(),
            StatusCode::BAD_REQUEST
        );

        assert!(temp.path().join("acme/ab/abcd").is_file());
    }

    #[tokio::test]
    async fn test_body_limit() {
        let temp = TempDir::new().unwrap();
        let app = app(
            &temp,
            ServerConfig {
                token: None,
                max_artifact_size: 4,
            },
        );

        let response = app
            .oneshot(request(Method::PUT, "/v8/artifacts/abcd", Body::from("too large")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}

//! HTTP API
//!
//! - `POST /api/v1/screenshot` with `{"urls": [...]}` dispatches capture jobs
//!   and returns one outcome per URL
//! - `GET /api/v1/screenshot?url=..&version=..` streams a stored screenshot,
//!   the latest version when `version` is omitted
//! - `GET /api/v1/screenshot/versions?url=..` lists versions, newest first
//! - `GET /health` liveness check

use crate::metadata::{Metadata, VersionRequest};
use crate::{Dispatcher, JobOutcome, ScreenshotQuery, StoreError};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const VERSION_HEADER: &str = "x-screenshot-version";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub query: ScreenshotQuery,
    /// Parent token for every dispatched batch
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateScreenshotsRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScreenshotParams {
    pub url: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VersionsParams {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("screenshot not found".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(ErrorBody { message: self.to_string() })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/screenshot",
            get(get_screenshot).post(create_screenshots),
        )
        .route("/api/v1/screenshot/versions", get(get_versions))
        .with_state(state)
}

/// Serve the API until `shutdown` fires.
pub async fn serve(address: &str, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("HTTP API listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("HTTP API stopped");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_screenshots(
    State(state): State<AppState>,
    body: Result<Json<CreateScreenshotsRequest>, JsonRejection>,
) -> Result<Json<Vec<JobOutcome>>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if request.urls.is_empty() {
        return Ok(Json(Vec::new()));
    }

    info!("Received screenshot request for {} URLs", request.urls.len());
    let outcomes = state.dispatcher.submit(request.urls, &state.cancel).await;
    Ok(Json(outcomes))
}

async fn get_screenshot(
    State(state): State<AppState>,
    Query(params): Query<ScreenshotParams>,
) -> Result<Response, ApiError> {
    let url = required_url(params.url)?;
    let version = parse_version(params.version.as_deref())?;

    let (record, reader) = state.query.get_screenshot(&url, version).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, record.content_type())
        .header(VERSION_HEADER, HeaderValue::from(record.version))
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn get_versions(
    State(state): State<AppState>,
    Query(params): Query<VersionsParams>,
) -> Result<Json<Vec<Metadata>>, ApiError> {
    let url = required_url(params.url)?;
    Ok(Json(state.query.get_versions(&url).await?))
}

fn required_url(url: Option<String>) -> Result<String, ApiError> {
    match url {
        Some(url) if !url.trim().is_empty() => Ok(url),
        _ => Err(ApiError::BadRequest("missing url parameter".to_string())),
    }
}

fn parse_version(raw: Option<&str>) -> Result<VersionRequest, ApiError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(VersionRequest::Latest);
    };
    match raw.parse::<u32>() {
        Ok(v) if v >= 1 => Ok(VersionRequest::Specific(v)),
        _ => Err(ApiError::BadRequest(format!(
            "invalid version {raw:?}, expected an integer >= 1"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataStore, MockMetadataStore};
    use crate::{BlobStore, ImageFormat, MemoryBlobStore, MemoryBus, MemoryMetadataStore};
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn state_with(metadata: Arc<dyn MetadataStore>, blobs: Arc<dyn BlobStore>) -> AppState {
        let bus = MemoryBus::new(8);
        AppState {
            dispatcher: Dispatcher::new(Arc::new(bus), Duration::from_millis(50)),
            query: ScreenshotQuery::new(metadata, blobs),
            cancel: CancellationToken::new(),
        }
    }

    async fn seeded_state() -> AppState {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        for n in 1..=2u8 {
            let blob_id = format!("blob-{n}");
            blobs.put(vec![n; 4], &blob_id, "https://a.example").await.unwrap();
            let mut record = Metadata::new("https://a.example", ImageFormat::Jpeg, 80, blob_id);
            metadata.save(&mut record).await.unwrap();
        }
        state_with(metadata, blobs).await
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn message(response: Response) -> String {
        let body: ErrorBody = serde_json::from_slice(&body_bytes(response).await).unwrap();
        body.message
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_latest_screenshot_is_streamed() {
        let app = router(seeded_state().await);
        let response = app
            .oneshot(get("/api/v1/screenshot?url=https://a.example"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(response.headers()[VERSION_HEADER], "2");
        assert_eq!(body_bytes(response).await, vec![2; 4]);
    }

    #[tokio::test]
    async fn test_specific_version() {
        let app = router(seeded_state().await);
        let response = app
            .oneshot(get("/api/v1/screenshot?url=https://a.example&version=1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, vec![1; 4]);
    }

    #[tokio::test]
    async fn test_bad_parameters_are_rejected() {
        let state = seeded_state().await;
        for uri in [
            "/api/v1/screenshot",
            "/api/v1/screenshot?url=https://a.example&version=0",
            "/api/v1/screenshot?url=https://a.example&version=latest",
            "/api/v1/screenshot/versions",
        ] {
            let response = router(state.clone()).oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_missing_screenshot_is_404() {
        let app = router(seeded_state().await);
        let response = app
            .oneshot(get("/api/v1/screenshot?url=https://a.example&version=7"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(message(response).await, "screenshot not found");
    }

    #[tokio::test]
    async fn test_store_failure_is_500() {
        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_get_all_versions()
            .returning(|_| Err(StoreError::Backend("connection refused".into())));
        let state = state_with(Arc::new(metadata), Arc::new(MemoryBlobStore::new())).await;

        let response = router(state)
            .oneshot(get("/api/v1/screenshot/versions?url=https://a.example"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(message(response).await.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_versions_newest_first() {
        let app = router(seeded_state().await);
        let response = app
            .oneshot(get("/api/v1/screenshot/versions?url=https://a.example"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let versions: Vec<Metadata> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        let numbers: Vec<u32> = versions.iter().map(|m| m.version).collect();
        assert_eq!(numbers, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_create_without_workers_reports_timeouts() {
        let app = router(seeded_state().await);
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/screenshot")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"urls":["https://a.example","nope"]}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let outcomes: Vec<JobOutcome> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].failure, Some(crate::FailureKind::Timeout));
        assert_eq!(outcomes[1].failure, Some(crate::FailureKind::InvalidUrl));
    }

    #[tokio::test]
    async fn test_empty_url_list_yields_empty_outcomes() {
        let app = router(seeded_state().await);
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/screenshot")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"urls":[]}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let outcomes: Vec<JobOutcome> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let app = router(seeded_state().await);
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/screenshot")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"urls\": 42}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(seeded_state().await).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

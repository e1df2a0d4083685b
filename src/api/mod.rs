//! JSON-over-HTTP surface: queue producers, job cancellation and the
//! synchronous unified-prompt endpoints.

mod jobs;
mod unified;
mod validation;

pub use validation::{GenerateRequest, ValidationError};

use crate::guest::GuestLimiter;
use crate::pipeline::Pipeline;
use crate::queue::WorkQueue;
use anyhow::Error;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn WorkQueue>,
    pub pipeline: Pipeline,
    pub guests: GuestLimiter,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/enqueue", post(jobs::enqueue))
        .route("/api/enqueue", post(jobs::enqueue))
        .route("/api/jobs/{job_id}/cancel", post(jobs::cancel))
        .route(
            "/api/unified-prompt/landing/generate",
            post(unified::landing_generate),
        )
        .route(
            "/api/unified-prompt/landing/check-limit",
            get(unified::landing_check_limit),
        )
        .route(
            "/api/unified-prompt/studio/generate",
            post(unified::studio_generate),
        )
        .route(
            "/api/unified-prompt/studio/check-credits",
            get(unified::studio_check_credits),
        )
        .route(
            "/api/unified-prompt/studio/analyze",
            post(unified::studio_analyze),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API until the token is cancelled, then drains open requests.
pub async fn serve(
    cancel_token: CancellationToken,
    listen: SocketAddr,
    state: AppState,
) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "HTTP API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel_token.cancelled().await })
        .await?;

    info!("HTTP API stopped.");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    GuestLimitReached,
    InvalidRequest,
    InternalError,
    Unauthorized,
    InvalidCategory,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::GuestLimitReached => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::InvalidRequest | ErrorCode::InvalidCategory => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failure body of the unified-prompt endpoints.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ApiError {
            status: code.status(),
            code,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::new(err.code(), err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(ErrorCode::InvalidRequest, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "success": false,
                "errorCode": self.code,
                "errorMessage": self.message,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::{self, png, MemoryFlags, MemoryQueue, MemoryStorage, MemoryStore, ScriptedGenerator};
    use crate::gemini::ImageGenerator;

    pub(crate) struct TestServer {
        pub base_url: String,
        pub client: reqwest::Client,
        pub store: Arc<MemoryStore>,
        pub storage: Arc<MemoryStorage>,
        pub queue: Arc<MemoryQueue>,
        pub flags: Arc<MemoryFlags>,
        handle: tokio::task::JoinHandle<()>,
    }

    impl TestServer {
        pub async fn spawn() -> Self {
            let generator = ScriptedGenerator::always(ScriptedGenerator::image_response(png(4, 4)));
            Self::with_generator(Arc::new(generator)).await
        }

        /// Same router as production, bound to an ephemeral port.
        pub async fn with_generator(generator: Arc<dyn ImageGenerator>) -> Self {
            let store = Arc::new(MemoryStore::default());
            let storage = Arc::new(MemoryStorage::default());
            let flags = Arc::new(MemoryFlags::default());
            let queue = Arc::new(MemoryQueue::new("jobs:queue"));
            let state = AppState {
                queue: queue.clone(),
                pipeline: testing::pipeline(store.clone(), storage.clone(), flags.clone(), generator),
                guests: GuestLimiter::new(flags.clone()),
            };

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base_url = format!("http://{}", listener.local_addr().unwrap());
            let handle = tokio::spawn(async move {
                axum::serve(listener, router(state)).await.unwrap();
            });

            TestServer {
                base_url,
                client: reqwest::Client::new(),
                store,
                storage,
                queue,
                flags,
                handle,
            }
        }

        pub async fn post(&self, path: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
            let res = self
                .client
                .post(format!("{}{}", self.base_url, path))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(res.status().as_u16()).unwrap();
            (status, res.json().await.unwrap())
        }

        pub async fn get(&self, path: &str) -> (StatusCode, serde_json::Value) {
            let res = self
                .client
                .get(format!("{}{}", self.base_url, path))
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(res.status().as_u16()).unwrap();
            (status, res.json().await.unwrap())
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.handle.abort();
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let server = TestServer::spawn().await;
        let (status, body) = server.get("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn malformed_body_gets_a_json_error() {
        let server = TestServer::spawn().await;
        let res = server
            .client
            .post(format!("{}/api/unified-prompt/studio/generate", server.base_url))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();

        assert_eq!(res.status().as_u16(), 400);
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["errorCode"], "INVALID_REQUEST");
    }

    #[test]
    fn error_codes_serialize_in_wire_form() {
        assert_eq!(
            serde_json::to_value(ErrorCode::GuestLimitReached).unwrap(),
            "GUEST_LIMIT_REACHED"
        );
        assert_eq!(ErrorCode::InvalidCategory.status(), StatusCode::BAD_REQUEST);
    }
}

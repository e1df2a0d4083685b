use super::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, instrument};

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub success: bool,
    pub message: String,
    pub job_id: String,
    pub queue: String,
    #[serde(rename = "queuePosition")]
    pub queue_position: i64,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub message: String,
    pub job_id: String,
    pub current_status: String,
    pub completed_images: i32,
    pub total_images: i32,
}

fn job_error(status: StatusCode, message: &str, job_id: Option<&str>) -> Response {
    let mut body = json!({ "success": false, "error": message });
    if let Some(job_id) = job_id {
        body["job_id"] = json!(job_id);
    }
    (status, Json(body)).into_response()
}

/// Pushes an already-written job id on the work queue.
#[instrument(skip_all)]
pub(super) async fn enqueue(
    State(state): State<AppState>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Response {
    let job_id = match body {
        Ok(Json(req)) => req.job_id.trim().to_string(),
        Err(rejection) => return job_error(StatusCode::BAD_REQUEST, &rejection.body_text(), None),
    };
    if job_id.is_empty() {
        return job_error(StatusCode::BAD_REQUEST, "job_id is required", None);
    }

    match state.queue.push(&job_id).await {
        Ok(queue_position) => {
            info!(job_id, queue_position, "Job enqueued");
            Json(EnqueueResponse {
                success: true,
                message: "Job enqueued".into(),
                job_id,
                queue: state.queue.name().to_string(),
                queue_position,
            })
            .into_response()
        }
        Err(err) => {
            error!(job_id, error = %err, "Failed to enqueue job");
            job_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to enqueue job",
                Some(&job_id),
            )
        }
    }
}

/// Requests cooperative cancellation. Finished jobs are reported as they
/// are, without setting a flag.
#[instrument(skip(state))]
pub(super) async fn cancel(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    let job = match state.pipeline.jobs().fetch_job(&job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return job_error(StatusCode::NOT_FOUND, "Job not found", Some(&job_id)),
        Err(err) => {
            error!(job_id, error = %err, "Failed to load job");
            return job_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load job",
                Some(&job_id),
            );
        }
    };

    let mut response = CancelResponse {
        success: false,
        message: String::new(),
        job_id: job.job_id.clone(),
        current_status: job.status.to_string(),
        completed_images: job.completed_images,
        total_images: job.total_images,
    };

    if job.status.is_terminal() {
        response.message = format!("Job already {}", job.status);
        return Json(response).into_response();
    }

    if let Err(err) = state.pipeline.cancellation().mark_cancelled(&job_id).await {
        error!(job_id, error = %err, "Failed to set cancel flag");
        return job_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to set cancel flag",
            Some(&job_id),
        );
    }

    response.success = true;
    response.message = "Cancel requested".into();
    Json(response).into_response()
}

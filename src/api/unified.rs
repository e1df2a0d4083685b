//! Synchronous one-shot generation for anonymous landing visitors and
//! signed-in studio members.

use super::validation::{GenerateRequest, ValidationError};
use super::{ApiError, AppState, ErrorCode};
use crate::category::Category;
use crate::gemini::ProviderError;
use crate::ledger::Actor;
use crate::non_blank;
use crate::pipeline::{Pipeline, PipelineError};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LandingResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub used_count: u32,
    pub max_count: u32,
    pub limit_reached: bool,
    pub redirect_to_login: bool,
}

impl LandingResponse {
    fn usage(used_count: u32, max_count: u32) -> Self {
        let limit_reached = used_count >= max_count;
        LandingResponse {
            used_count,
            max_count,
            limit_reached,
            redirect_to_login: limit_reached,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudioResponse {
    pub success: bool,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyzeRequest {
    pub image_url: String,
    pub category: String,
}

fn encode(image: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(image)
}

fn generation_failed(err: PipelineError) -> ApiError {
    error!(error = %err, "Generation failed");
    let message = match err {
        PipelineError::Provider(ProviderError::Blocked { .. }) => {
            "Image service is busy, please try again shortly"
        }
        _ => "Image generation failed",
    };
    ApiError::new(ErrorCode::InternalError, message)
}

/// Balance the member's next image would be charged against.
async fn available_credits(pipeline: &Pipeline, user_id: &str) -> Result<i64, anyhow::Error> {
    let ledger = pipeline.ledger();
    let org_id = ledger.store().member_organization(user_id).await?;
    let account = ledger
        .resolve_account(&Actor {
            user_id: user_id.to_string(),
            org_id,
        })
        .await?;
    ledger.store().balance(&account).await
}

#[instrument(skip_all)]
pub(super) async fn landing_generate(
    State(state): State<AppState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<LandingResponse>), ApiError> {
    let Json(req) = body?;
    let aspect_ratio = req.validate()?;
    let session_id = req.session_id()?;
    let max_count = state.guests.max_generations();

    let (usage, limit_reached) = state.guests.check_limit(session_id).await;
    if limit_reached {
        info!(session_id, used = usage.used_count, "Guest limit reached");
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(LandingResponse {
                error_message: Some("Free generation limit reached, please sign in".into()),
                error_code: Some(ErrorCode::GuestLimitReached),
                ..LandingResponse::usage(usage.used_count, max_count)
            }),
        ));
    }

    let references = req.references()?;
    let image = state
        .pipeline
        .generate_once(Category::Landing, req.prompt.trim(), aspect_ratio, references)
        .await
        .map_err(generation_failed)?;

    let usage = state.guests.increment(session_id).await;
    Ok((
        StatusCode::OK,
        Json(LandingResponse {
            success: true,
            job_id: Some(Uuid::new_v4().to_string()),
            image_base64: Some(encode(&image)),
            ..LandingResponse::usage(usage.used_count, max_count)
        }),
    ))
}

pub(super) async fn landing_check_limit(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<LandingResponse>, ApiError> {
    let session_id = non_blank(query.session_id.as_deref()).ok_or(ValidationError::MissingSession)?;
    let (usage, _) = state.guests.check_limit(session_id).await;
    Ok(Json(LandingResponse {
        success: true,
        ..LandingResponse::usage(usage.used_count, state.guests.max_generations())
    }))
}

#[instrument(skip_all)]
pub(super) async fn studio_generate(
    State(state): State<AppState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<StudioResponse>, ApiError> {
    let Json(req) = body?;
    let aspect_ratio = req.validate()?;
    let (user_id, category) = req.member()?;
    let references = req.references()?;
    let pipeline = &state.pipeline;

    match available_credits(pipeline, user_id).await {
        Ok(credits) if credits < pipeline.price_per_image() => {
            info!(user_id, credits, "Insufficient credits");
            return Err(ApiError::new(ErrorCode::Unauthorized, "Insufficient credits")
                .with_status(StatusCode::PAYMENT_REQUIRED));
        }
        Ok(_) => {}
        Err(err) => warn!(user_id, error = %err, "Credit check failed, continuing"),
    }

    let image = pipeline
        .generate_once(category, req.prompt.trim(), aspect_ratio, references)
        .await
        .map_err(generation_failed)?;
    let job_id = Uuid::new_v4().to_string();

    match pipeline.store_generated(user_id, image.clone()).await {
        Ok(attachment) => {
            if let Err(err) = pipeline.charge_single(user_id, attachment.id).await {
                error!(user_id, attachment_id = attachment.id, error = %err, "Failed to charge studio image");
            }
            info!(user_id, %category, attachment_id = attachment.id, "Studio image stored");
            Ok(Json(StudioResponse {
                success: true,
                job_id,
                image_url: Some(pipeline.storage().public_url(&attachment.file_path)),
                attach_id: Some(attachment.id),
                ..Default::default()
            }))
        }
        Err(err) => {
            warn!(user_id, error = %err, "Upload failed, returning image inline");
            Ok(Json(StudioResponse {
                success: true,
                job_id,
                image_base64: Some(encode(&image)),
                ..Default::default()
            }))
        }
    }
}

pub(super) async fn studio_check_credits(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = non_blank(query.user_id.as_deref())
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidRequest, "User ID is required"))?;

    let credits = available_credits(&state.pipeline, user_id).await.map_err(|err| {
        error!(user_id, error = %err, "Failed to check credits");
        ApiError::new(ErrorCode::InternalError, "Failed to check credits")
    })?;
    Ok(Json(serde_json::json!({ "success": true, "credits": credits })))
}

#[instrument(skip_all)]
pub(super) async fn studio_analyze(
    State(state): State<AppState>,
    body: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = body?;
    let image_url = non_blank(Some(req.image_url.as_str())).ok_or(ValidationError::MissingImageUrl)?;
    let category = if req.category.trim().is_empty() {
        Category::Fashion
    } else {
        Category::parse_studio(&req.category)
            .ok_or_else(|| ValidationError::Category(req.category.clone()))?
    };

    let prompt = state.pipeline.analyze(image_url, category).await.map_err(|err| {
        error!(%category, error = %err, "Analysis failed");
        ApiError::new(ErrorCode::InternalError, "Image analysis failed")
    })?;
    Ok(Json(serde_json::json!({ "success": true, "prompt": prompt })))
}

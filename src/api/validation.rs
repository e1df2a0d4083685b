use super::ErrorCode;
use crate::category::Category;
use crate::non_blank;
use crate::pipeline::decode_data_url;
use serde::Deserialize;

pub const MAX_PROMPT_CHARS: usize = 2000;
pub const MAX_REFERENCE_IMAGES: usize = 3;
pub const ASPECT_RATIOS: [&str; 5] = ["1:1", "16:9", "9:16", "4:3", "3:4"];
const DEFAULT_ASPECT_RATIO: &str = "1:1";

/// Request rejected before any external call is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Prompt is required")]
    MissingPrompt,

    #[error("Prompt must be at most {} characters", MAX_PROMPT_CHARS)]
    PromptTooLong,

    #[error("At most {} reference images are allowed", MAX_REFERENCE_IMAGES)]
    TooManyImages,

    #[error("Unsupported aspect ratio: {0}")]
    AspectRatio(String),

    #[error("Reference image {0} is not valid base64")]
    ReferenceImage(usize),

    #[error("Session ID is required")]
    MissingSession,

    #[error("User ID is required")]
    MissingUser,

    #[error("Invalid category: {0}")]
    Category(String),

    #[error("Image URL is required")]
    MissingImageUrl,
}

impl ValidationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ValidationError::MissingUser => ErrorCode::Unauthorized,
            ValidationError::Category(_) => ErrorCode::InvalidCategory,
            _ => ErrorCode::InvalidRequest,
        }
    }
}

/// Body shared by the landing and studio generate endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerateRequest {
    pub prompt: String,
    pub reference_images: Vec<String>,
    pub aspect_ratio: String,
    pub user_id: String,
    pub session_id: String,
    pub category: String,
}

impl GenerateRequest {
    /// Checks common to both paths. Returns the effective aspect ratio.
    pub fn validate(&self) -> Result<&str, ValidationError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(ValidationError::MissingPrompt);
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(ValidationError::PromptTooLong);
        }
        if self.reference_images.len() > MAX_REFERENCE_IMAGES {
            return Err(ValidationError::TooManyImages);
        }
        aspect_ratio(&self.aspect_ratio)
    }

    pub fn session_id(&self) -> Result<&str, ValidationError> {
        non_blank(Some(self.session_id.as_str())).ok_or(ValidationError::MissingSession)
    }

    /// The member and studio category a studio request acts for.
    pub fn member(&self) -> Result<(&str, Category), ValidationError> {
        let user_id = non_blank(Some(self.user_id.as_str())).ok_or(ValidationError::MissingUser)?;
        let category = Category::parse_studio(&self.category)
            .ok_or_else(|| ValidationError::Category(self.category.clone()))?;
        Ok((user_id, category))
    }

    pub fn references(&self) -> Result<Vec<Vec<u8>>, ValidationError> {
        self.reference_images
            .iter()
            .enumerate()
            .map(|(i, image)| decode_data_url(image).map_err(|_| ValidationError::ReferenceImage(i)))
            .collect()
    }
}

pub fn aspect_ratio(raw: &str) -> Result<&str, ValidationError> {
    let ratio = raw.trim();
    if ratio.is_empty() {
        return Ok(DEFAULT_ASPECT_RATIO);
    }
    ASPECT_RATIOS
        .iter()
        .find(|r| **r == ratio)
        .copied()
        .ok_or_else(|| ValidationError::AspectRatio(ratio.to_string()))
}

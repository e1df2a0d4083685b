//! Generative-image provider seam and its Gemini REST implementation.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("provider request failed: {0}")]
    Transport(String),

    #[error("no candidates in response")]
    NoCandidates,

    #[error("no image data in response")]
    NoImage,

    #[error("undecodable response payload: {0}")]
    Decode(String),

    #[error("generation blocked after {attempts} rate-limited attempts: {last}")]
    Blocked { attempts: u32, last: String },
}

impl ProviderError {
    /// Quota exhaustion or throttling, worth another attempt.
    pub fn is_rate_limited(&self) -> bool {
        let text = match self {
            ProviderError::Api { status: 429, .. } => return true,
            ProviderError::Api { message, .. } => message,
            ProviderError::Transport(message) => message,
            _ => return false,
        };
        let lower = text.to_lowercase();
        lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("quota")
            || lower.contains("resource_exhausted")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Image { mime_type: String, data: Vec<u8> },
}

impl Part {
    pub fn image(data: Vec<u8>) -> Self {
        let mime_type = image::guess_format(&data)
            .map(|format| format.to_mime_type())
            .unwrap_or("image/png")
            .to_string();
        Part::Image { mime_type, data }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Image,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub aspect_ratio: Option<String>,
    pub response: ResponseKind,
}

impl GenerationConfig {
    pub fn image(aspect_ratio: &str, temperature: f32) -> Self {
        GenerationConfig {
            temperature: Some(temperature),
            aspect_ratio: Some(aspect_ratio.to_string()),
            response: ResponseKind::Image,
        }
    }

    pub fn text(temperature: f32) -> Self {
        GenerationConfig {
            temperature: Some(temperature),
            aspect_ratio: None,
            response: ResponseKind::Text,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateResponse {
    pub candidates: Vec<Vec<Part>>,
}

impl GenerateResponse {
    pub fn first_image(&self) -> Result<Vec<u8>, ProviderError> {
        if self.candidates.is_empty() {
            return Err(ProviderError::NoCandidates);
        }
        self.candidates
            .iter()
            .flatten()
            .find_map(|part| match part {
                Part::Image { data, .. } if !data.is_empty() => Some(data.clone()),
                _ => None,
            })
            .ok_or(ProviderError::NoImage)
    }

    pub fn first_text(&self) -> Option<String> {
        self.candidates.iter().flatten().find_map(|part| match part {
            Part::Text(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            _ => None,
        })
    }
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(
        &self,
        credential: &str,
        model: &str,
        content: &Content,
        config: &GenerationConfig,
    ) -> Result<GenerateResponse, ProviderError>;
}

/// `models/{model}:generateContent` over HTTPS. No request timeout: image
/// generation can legitimately run for a long time.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    endpoint: String,
}

impl GeminiClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        GeminiClient {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ImageGenerator for GeminiClient {
    #[instrument(name = "gemini.generate", skip_all, fields(model = %model, parts = content.parts.len()))]
    async fn generate(
        &self,
        credential: &str,
        model: &str,
        content: &Content,
        config: &GenerationConfig,
    ) -> Result<GenerateResponse, ProviderError> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, model);
        let body = WireRequest::new(content, config);

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        debug!(candidates = wire.candidates.len(), "Received provider response");
        wire.into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    contents: Vec<WireContent>,
    generation_config: WireGenerationConfig,
}

#[derive(Serialize, Deserialize, Default)]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireBlob>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBlob {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    response_modalities: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_config: Option<WireImageConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireImageConfig {
    aspect_ratio: String,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
}

#[derive(Deserialize)]
struct WireCandidate {
    content: Option<WireContent>,
}

impl WireRequest {
    fn new(content: &Content, config: &GenerationConfig) -> Self {
        let engine = base64::engine::general_purpose::STANDARD;
        let parts = content
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => WirePart {
                    text: Some(text.clone()),
                    inline_data: None,
                },
                Part::Image { mime_type, data } => WirePart {
                    text: None,
                    inline_data: Some(WireBlob {
                        mime_type: mime_type.clone(),
                        data: engine.encode(data),
                    }),
                },
            })
            .collect();

        let response_modalities = match config.response {
            ResponseKind::Image => vec!["TEXT", "IMAGE"],
            ResponseKind::Text => vec!["TEXT"],
        };

        WireRequest {
            contents: vec![WireContent {
                role: Some("user".to_string()),
                parts,
            }],
            generation_config: WireGenerationConfig {
                temperature: config.temperature,
                response_modalities,
                image_config: config.aspect_ratio.as_ref().map(|ratio| WireImageConfig {
                    aspect_ratio: ratio.clone(),
                }),
            },
        }
    }
}

impl WireResponse {
    fn into_response(self) -> Result<GenerateResponse, ProviderError> {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut candidates = Vec::with_capacity(self.candidates.len());
        for candidate in self.candidates {
            let mut parts = Vec::new();
            for part in candidate.content.unwrap_or_default().parts {
                if let Some(blob) = part.inline_data {
                    let data = engine
                        .decode(blob.data.as_bytes())
                        .map_err(|e| ProviderError::Decode(e.to_string()))?;
                    parts.push(Part::Image {
                        mime_type: blob.mime_type,
                        data,
                    });
                } else if let Some(text) = part.text {
                    parts.push(Part::Text(text));
                }
            }
            candidates.push(parts);
        }
        Ok(GenerateResponse { candidates })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limits() {
        let throttled = ProviderError::Api {
            status: 429,
            message: String::new(),
        };
        let quota = ProviderError::Api {
            status: 400,
            message: "Quota exceeded for project".into(),
        };
        let transport = ProviderError::Transport("upstream said: Rate Limit reached".into());
        let bad_request = ProviderError::Api {
            status: 400,
            message: "invalid argument".into(),
        };

        assert!(throttled.is_rate_limited());
        assert!(quota.is_rate_limited());
        assert!(transport.is_rate_limited());
        assert!(!bad_request.is_rate_limited());
        assert!(!ProviderError::NoImage.is_rate_limited());
    }

    #[test]
    fn first_image_distinguishes_missing_candidates_from_missing_image() {
        let empty = GenerateResponse::default();
        assert!(matches!(empty.first_image(), Err(ProviderError::NoCandidates)));

        let text_only = GenerateResponse {
            candidates: vec![vec![Part::Text("sorry".into())]],
        };
        assert!(matches!(text_only.first_image(), Err(ProviderError::NoImage)));

        let with_image = GenerateResponse {
            candidates: vec![
                vec![Part::Text("here you go".into())],
                vec![Part::Image {
                    mime_type: "image/png".into(),
                    data: vec![1, 2, 3],
                }],
            ],
        };
        assert_eq!(with_image.first_image().unwrap(), vec![1, 2, 3]);
        assert_eq!(with_image.first_text().as_deref(), Some("here you go"));
    }

    #[test]
    fn wire_response_decodes_inline_data() {
        let raw = serde_json::json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "ok"},
                        {"inlineData": {"mimeType": "image/png", "data": "AQID"}}
                    ]
                }
            }]
        });
        let wire: WireResponse = serde_json::from_value(raw).unwrap();
        let response = wire.into_response().unwrap();
        assert_eq!(response.first_image().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn wire_request_carries_aspect_ratio() {
        let content = Content {
            parts: vec![Part::Text("a cat".into())],
        };
        let body = serde_json::to_value(WireRequest::new(
            &content,
            &GenerationConfig::image("16:9", 0.45),
        ))
        .unwrap();

        assert_eq!(body["generationConfig"]["imageConfig"]["aspectRatio"], "16:9");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "a cat");
    }
}

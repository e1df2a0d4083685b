use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

pub mod api;
pub mod cancel;
pub mod category;
pub mod compositor;
pub mod config;
pub mod db;
pub mod flags;
pub mod gemini;
pub mod guest;
pub mod ledger;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod server;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub job_id: String,
    pub job_type: String,
    pub route: String,
    pub status: Status,
    pub total_images: i32,
    pub completed_images: i32,
    pub generated_attachment_ids: Vec<i64>,
    pub production_id: Option<String>,
    pub member_id: Option<String>,
    pub org_id: Option<String>,
    pub input: Json<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Typed view over the free-form `input` column. Unreadable input
    /// degrades to defaults rather than failing the job outright.
    pub fn parsed_input(&self) -> JobInput {
        match serde_json::from_value(self.input.0.clone()) {
            Ok(input) => input,
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, error = %err, "Unreadable job input, using defaults");
                JobInput::default()
            }
        }
    }

    pub fn has_input_field(&self, field: &str) -> bool {
        self.input.0.get(field).map_or(false, |v| !v.is_null())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status_enum", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Processing,
    Completed,
    Failed,
    UserCancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::UserCancelled)
    }

    /// Transitions are monotone: nothing leaves a terminal state.
    pub fn can_transition_to(self, next: Status) -> bool {
        match self {
            Status::Pending => next != Status::Pending,
            Status::Processing => next != Status::Pending,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::UserCancelled => "user_cancelled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobInput {
    pub base_prompt: Option<String>,
    pub prompt: Option<String>,
    #[serde(rename = "aspect-ratio")]
    pub aspect_ratio_legacy: Option<String>,
    pub aspect_ratio: Option<String>,
    pub user_id: Option<String>,
    #[serde(rename = "individualImageAttachIds")]
    pub attachments: Vec<AttachmentRef>,
    pub reference_images: Vec<String>,
    pub original_image_url: Option<String>,
    pub mask_data_url: Option<String>,
    pub combinations: Vec<Combination>,
}

impl JobInput {
    pub fn prompt(&self) -> &str {
        non_blank(self.base_prompt.as_deref())
            .or_else(|| non_blank(self.prompt.as_deref()))
            .unwrap_or("best quality, masterpiece")
    }

    pub fn aspect_ratio(&self) -> &str {
        non_blank(self.aspect_ratio_legacy.as_deref())
            .or_else(|| non_blank(self.aspect_ratio.as_deref()))
            .unwrap_or("16:9")
    }

    pub fn user_id(&self) -> Option<&str> {
        non_blank(self.user_id.as_deref())
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentRef {
    #[serde(rename = "attachId", deserialize_with = "lenient::int")]
    pub attachment_id: i64,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Combination {
    pub angle: Option<String>,
    pub shot: Option<String>,
    #[serde(deserialize_with = "lenient::opt_int")]
    pub quantity: Option<i64>,
}

/// Producers write numbers as JSON floats or strings; accept all of them.
mod lenient {
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    fn to_int(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let value = Value::deserialize(d)?;
        to_int(&value).ok_or_else(|| D::Error::custom(format!("not an integer: {value}")))
    }

    pub fn opt_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        Ok(to_int(&Value::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Attachment {
    pub id: i64,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub mime_type: String,
    pub storage_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub file_path: String,
    pub file_size: i64,
    pub mime_type: String,
}

impl NewAttachment {
    pub fn file_name(&self) -> &str {
        self.file_path
            .rsplit_once('/')
            .map_or(self.file_path.as_str(), |(_, name)| name)
    }
}

/// Whose balance a debit lands on. Never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Account {
    Member(String),
    Organization(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditTransaction {
    pub user_id: String,
    pub org_id: Option<String>,
    pub transaction_type: String,
    pub amount: i64,
    pub balance_after: i64,
    pub description: String,
    pub attachment_id: i64,
    pub job_id: String,
    pub production_id: Option<String>,
    pub api_provider: String,
}

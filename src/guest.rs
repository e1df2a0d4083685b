use crate::flags::EphemeralStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const MAX_GUEST_GENERATIONS: u32 = 2;
const GUEST_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestUsage {
    pub session_id: String,
    pub used_count: u32,
    pub first_used_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl GuestUsage {
    fn fresh(session_id: &str) -> Self {
        GuestUsage {
            session_id: session_id.to_string(),
            used_count: 0,
            first_used_at: None,
            last_used_at: None,
        }
    }
}

/// Free-use cap for anonymous sessions. Never blocks traffic when the
/// backing store is down.
#[derive(Clone)]
pub struct GuestLimiter {
    flags: Arc<dyn EphemeralStore>,
    max_generations: u32,
}

impl GuestLimiter {
    pub fn new(flags: Arc<dyn EphemeralStore>) -> Self {
        GuestLimiter {
            flags,
            max_generations: MAX_GUEST_GENERATIONS,
        }
    }

    pub fn max_generations(&self) -> u32 {
        self.max_generations
    }

    fn key(session_id: &str) -> String {
        format!("guest:usage:{session_id}")
    }

    async fn load(&self, session_id: &str) -> Result<GuestUsage, anyhow::Error> {
        match self.flags.get(&Self::key(session_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(GuestUsage::fresh(session_id)),
        }
    }

    pub async fn check_limit(&self, session_id: &str) -> (GuestUsage, bool) {
        match self.load(session_id).await {
            Ok(usage) => {
                let reached = usage.used_count >= self.max_generations;
                (usage, reached)
            }
            Err(err) => {
                warn!(session_id, error = %err, "Guest usage lookup failed, allowing request");
                (GuestUsage::fresh(session_id), false)
            }
        }
    }

    /// Records one more generation. When the store is down the returned
    /// usage is computed but not persisted.
    pub async fn increment(&self, session_id: &str) -> GuestUsage {
        let mut usage = match self.load(session_id).await {
            Ok(usage) => usage,
            Err(err) => {
                warn!(session_id, error = %err, "Guest usage lookup failed");
                GuestUsage::fresh(session_id)
            }
        };

        let now = Utc::now();
        usage.used_count += 1;
        usage.last_used_at = Some(now);
        usage.first_used_at.get_or_insert(now);

        match serde_json::to_string(&usage) {
            Ok(raw) => {
                if let Err(err) = self.flags.set(&Self::key(session_id), &raw, GUEST_WINDOW).await {
                    warn!(session_id, error = %err, "Failed to save guest usage");
                }
            }
            Err(err) => warn!(session_id, error = %err, "Failed to encode guest usage"),
        }

        info!(
            session_id,
            used = usage.used_count,
            max = self.max_generations,
            "Guest usage updated"
        );
        usage
    }
}

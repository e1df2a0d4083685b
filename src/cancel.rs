use crate::flags::EphemeralStore;
use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CANCEL_TTL: Duration = Duration::from_secs(60 * 60);

fn cancel_key(job_id: &str) -> String {
    format!("job:cancel:{job_id}")
}

/// Cooperative cancellation flags keyed by job id.
#[derive(Clone)]
pub struct CancellationStore {
    flags: Arc<dyn EphemeralStore>,
    ttl: Duration,
}

impl CancellationStore {
    pub fn new(flags: Arc<dyn EphemeralStore>) -> Self {
        CancellationStore {
            flags,
            ttl: CANCEL_TTL,
        }
    }

    pub async fn mark_cancelled(&self, job_id: &str) -> Result<(), Error> {
        self.flags.set(&cancel_key(job_id), "1", self.ttl).await?;
        info!(job_id, "Cancel flag set");
        Ok(())
    }

    /// Fails open: an unreachable store reads as "not cancelled".
    pub async fn is_cancelled(&self, job_id: &str) -> bool {
        match self.flags.get(&cancel_key(job_id)).await {
            Ok(flag) => flag.is_some(),
            Err(err) => {
                warn!(job_id, error = %err, "Cancel check failed, assuming not cancelled");
                false
            }
        }
    }
}

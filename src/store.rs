use crate::{Account, Attachment, CreditTransaction, Job, NewAttachment, Status};
use anyhow::Error;
use async_trait::async_trait;

/// Job, attachment and production rows.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn fetch_job(&self, job_id: &str) -> Result<Option<Job>, Error>;

    /// Atomically moves a pending job to processing. With `resume`, a job
    /// already in processing is taken over as well. Returns false when the
    /// job was not claimable, so only one worker ever runs it.
    async fn claim_job(&self, job_id: &str, resume: bool) -> Result<bool, Error>;

    /// Hands a claimed job that never reached a worker back to pending.
    async fn release_job(&self, job_id: &str) -> Result<bool, Error>;

    /// Records progress. `completed_images` is clamped to the job's
    /// `total_images` and the id list must already be free of duplicates.
    async fn update_progress(
        &self,
        job_id: &str,
        completed_images: i32,
        attachment_ids: &[i64],
    ) -> Result<(), Error>;

    /// Moves a non-terminal job to `status` (completed or user_cancelled).
    async fn finish_job(&self, job_id: &str, status: Status) -> Result<bool, Error>;

    async fn fail_job(&self, job_id: &str, msg: &str) -> Result<bool, Error>;

    async fn processing_job_ids(&self) -> Result<Vec<String>, Error>;

    async fn create_attachment(&self, attachment: &NewAttachment) -> Result<Attachment, Error>;

    async fn fetch_attachment(&self, id: i64) -> Result<Option<Attachment>, Error>;

    async fn update_production(
        &self,
        production_id: &str,
        status: Status,
        attachment_ids: &[i64],
    ) -> Result<(), Error>;
}

/// Balances, organization lookups and the credit transaction log.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn organization_status(&self, org_id: &str) -> Result<Option<String>, Error>;

    async fn member_organization(&self, member_id: &str) -> Result<Option<String>, Error>;

    async fn balance(&self, account: &Account) -> Result<i64, Error>;

    /// Records a charge key for each `(job_id, attachment)` not seen before
    /// and subtracts `price` per new key from `account`, in one
    /// transaction. Neither write happens without the other.
    async fn debit_batch(
        &self,
        account: &Account,
        job_id: &str,
        attachment_ids: &[i64],
        price: i64,
    ) -> Result<BatchDebit, Error>;

    /// Descriptive audit row. Not consulted for idempotency.
    async fn append_transaction(&self, transaction: &CreditTransaction) -> Result<(), Error>;
}

/// Result of [`LedgerStore::debit_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDebit {
    /// Attachments charged by this call, in request order.
    pub charged: Vec<i64>,
    /// Balance after the write, `None` when nothing was new.
    pub balance_after: Option<i64>,
}

/// Appends `new` to `existing`, keeping first-seen order and dropping
/// duplicates.
pub fn merge_attachment_ids(existing: &[i64], new: &[i64]) -> Vec<i64> {
    let mut merged = Vec::with_capacity(existing.len() + new.len());
    for id in existing.iter().chain(new) {
        if !merged.contains(id) {
            merged.push(*id);
        }
    }
    merged
}

/// In-task progress of one job.
#[derive(Debug, Default)]
pub struct Progress {
    total: i32,
    attachment_ids: Vec<i64>,
}

impl Progress {
    pub fn new(total: i32, existing: &[i64]) -> Self {
        Progress {
            total,
            attachment_ids: merge_attachment_ids(&[], existing),
        }
    }

    /// Returns false if the id was already recorded.
    pub fn record(&mut self, attachment_id: i64) -> bool {
        if self.attachment_ids.contains(&attachment_id) {
            return false;
        }
        self.attachment_ids.push(attachment_id);
        true
    }

    pub fn completed(&self) -> i32 {
        (self.attachment_ids.len() as i32).min(self.total)
    }

    pub fn attachment_ids(&self) -> &[i64] {
        &self.attachment_ids
    }
}

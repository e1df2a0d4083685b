use crate::store::{merge_attachment_ids, BatchDebit, JobStore, LedgerStore};
use crate::{Account, Attachment, CreditTransaction, Job, NewAttachment, Status};
use anyhow::{anyhow, Error};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::{debug, instrument};

const JOB_COLUMNS: &str = "job_id, job_type, route, status, total_images, completed_images, \
    generated_attachment_ids, production_id, member_id, org_id, input, error_message, \
    created_at, started_at, completed_at";

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }

    async fn set_terminal(&self, job_id: &str, status: Status, msg: Option<&str>) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE generation_jobs \
                SET status = $2, \
                error_message = COALESCE($3, error_message), \
                completed_at = now(), \
                updated_at = now() \
            WHERE job_id = $1 AND status IN ('pending', 'processing')",
        )
        .bind(job_id)
        .bind(status)
        .bind(msg)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl JobStore for DbHandle {
    #[instrument(name = "db.fetch_job", skip(self))]
    async fn fetch_job(&self, job_id: &str) -> Result<Option<Job>, Error> {
        debug!("Fetching job");
        Ok(sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&*self.pool)
        .await?)
    }

    #[instrument(name = "db.claim_job", skip(self))]
    async fn claim_job(&self, job_id: &str, resume: bool) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE generation_jobs \
                SET status = 'processing', \
                started_at = COALESCE(started_at, now()), \
                updated_at = now() \
            WHERE job_id = $1 \
                AND (status = 'pending' OR ($2 AND status = 'processing'))",
        )
        .bind(job_id)
        .bind(resume)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(name = "db.release_job", skip(self))]
    async fn release_job(&self, job_id: &str) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE generation_jobs \
                SET status = 'pending', \
                updated_at = now() \
            WHERE job_id = $1 AND status = 'processing'",
        )
        .bind(job_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(name = "db.update_progress", skip(self, attachment_ids))]
    async fn update_progress(
        &self,
        job_id: &str,
        completed_images: i32,
        attachment_ids: &[i64],
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE generation_jobs \
                SET completed_images = LEAST($2, total_images), \
                generated_attachment_ids = $3, \
                updated_at = now() \
            WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(completed_images)
        .bind(attachment_ids)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    #[instrument(name = "db.finish_job", skip(self))]
    async fn finish_job(&self, job_id: &str, status: Status) -> Result<bool, Error> {
        self.set_terminal(job_id, status, None).await
    }

    #[instrument(name = "db.fail_job", skip(self))]
    async fn fail_job(&self, job_id: &str, msg: &str) -> Result<bool, Error> {
        self.set_terminal(job_id, Status::Failed, Some(msg)).await
    }

    async fn processing_job_ids(&self) -> Result<Vec<String>, Error> {
        debug!("Getting processing jobs");
        Ok(sqlx::query_scalar(
            "SELECT job_id FROM generation_jobs \
            WHERE status = 'processing' \
            ORDER BY started_at ASC",
        )
        .fetch_all(&*self.pool)
        .await?)
    }

    #[instrument(name = "db.create_attachment", skip_all, fields(path = %attachment.file_path))]
    async fn create_attachment(&self, attachment: &NewAttachment) -> Result<Attachment, Error> {
        Ok(sqlx::query_as::<_, Attachment>(
            "INSERT INTO attachments \
            (file_name, file_path, file_size, mime_type, storage_type) \
            VALUES ($1, $2, $3, $4, 'supabase') \
            RETURNING id, file_name, file_path, file_size, mime_type, storage_type, created_at",
        )
        .bind(attachment.file_name())
        .bind(&attachment.file_path)
        .bind(attachment.file_size)
        .bind(&attachment.mime_type)
        .fetch_one(&*self.pool)
        .await?)
    }

    async fn fetch_attachment(&self, id: i64) -> Result<Option<Attachment>, Error> {
        Ok(sqlx::query_as::<_, Attachment>(
            "SELECT id, file_name, file_path, file_size, mime_type, storage_type, created_at \
            FROM attachments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?)
    }

    #[instrument(name = "db.update_production", skip(self, attachment_ids))]
    async fn update_production(
        &self,
        production_id: &str,
        status: Status,
        attachment_ids: &[i64],
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<Vec<i64>> = sqlx::query_scalar(
            "SELECT attachment_ids FROM productions WHERE production_id = $1 FOR UPDATE",
        )
        .bind(production_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(existing) = existing else {
            return Err(anyhow!("production not found: {production_id}"));
        };

        sqlx::query(
            "UPDATE productions SET status = $2, attachment_ids = $3 WHERE production_id = $1",
        )
        .bind(production_id)
        .bind(status.as_str())
        .bind(merge_attachment_ids(&existing, attachment_ids))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for DbHandle {
    async fn organization_status(&self, org_id: &str) -> Result<Option<String>, Error> {
        Ok(
            sqlx::query_scalar("SELECT status FROM organizations WHERE org_id = $1")
                .bind(org_id)
                .fetch_optional(&*self.pool)
                .await?,
        )
    }

    async fn member_organization(&self, member_id: &str) -> Result<Option<String>, Error> {
        Ok(sqlx::query_scalar(
            "SELECT org_id FROM organization_members \
            WHERE member_id = $1 AND status = 'active' \
            LIMIT 1",
        )
        .bind(member_id)
        .fetch_optional(&*self.pool)
        .await?)
    }

    async fn balance(&self, account: &Account) -> Result<i64, Error> {
        let balance: Option<i64> = match account {
            Account::Member(id) => {
                sqlx::query_scalar("SELECT credit FROM members WHERE member_id = $1")
                    .bind(id)
                    .fetch_optional(&*self.pool)
                    .await?
            }
            Account::Organization(id) => {
                sqlx::query_scalar("SELECT credit FROM organizations WHERE org_id = $1")
                    .bind(id)
                    .fetch_optional(&*self.pool)
                    .await?
            }
        };

        balance.ok_or_else(|| anyhow!("account not found: {account:?}"))
    }

    #[instrument(name = "db.debit_batch", skip(self, attachment_ids))]
    async fn debit_batch(
        &self,
        account: &Account,
        job_id: &str,
        attachment_ids: &[i64],
        price: i64,
    ) -> Result<BatchDebit, Error> {
        let mut tx = self.pool.begin().await?;

        let inserted: Vec<i64> = sqlx::query_scalar(
            "INSERT INTO ledger_charges (job_id, attachment_id) \
            SELECT $1, id FROM UNNEST($2::BIGINT[]) AS id \
            ON CONFLICT DO NOTHING \
            RETURNING attachment_id",
        )
        .bind(job_id)
        .bind(attachment_ids)
        .fetch_all(&mut *tx)
        .await?;

        let charged: Vec<i64> = attachment_ids
            .iter()
            .copied()
            .filter(|id| inserted.contains(id))
            .collect();
        if charged.is_empty() {
            tx.commit().await?;
            return Ok(BatchDebit {
                charged,
                balance_after: None,
            });
        }

        let amount = charged.len() as i64 * price;
        let balance: Option<i64> = match account {
            Account::Member(id) => {
                sqlx::query_scalar(
                    "UPDATE members SET credit = credit - $2 WHERE member_id = $1 RETURNING credit",
                )
                .bind(id)
                .bind(amount)
                .fetch_optional(&mut *tx)
                .await?
            }
            Account::Organization(id) => {
                sqlx::query_scalar(
                    "UPDATE organizations SET credit = credit - $2 WHERE org_id = $1 RETURNING credit",
                )
                .bind(id)
                .bind(amount)
                .fetch_optional(&mut *tx)
                .await?
            }
        };

        // Dropping `tx` rolls the charge keys back.
        let Some(balance) = balance else {
            return Err(anyhow!("account not found: {account:?}"));
        };
        tx.commit().await?;

        Ok(BatchDebit {
            charged,
            balance_after: Some(balance),
        })
    }

    async fn append_transaction(&self, transaction: &CreditTransaction) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO credit_transactions \
            (user_id, org_id, transaction_type, amount, balance_after, description, \
             attachment_id, job_id, production_id, api_provider) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
            ON CONFLICT (job_id, attachment_id) DO NOTHING",
        )
        .bind(&transaction.user_id)
        .bind(&transaction.org_id)
        .bind(&transaction.transaction_type)
        .bind(transaction.amount)
        .bind(transaction.balance_after)
        .bind(&transaction.description)
        .bind(transaction.attachment_id)
        .bind(&transaction.job_id)
        .bind(&transaction.production_id)
        .bind(&transaction.api_provider)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}

use crate::store::{merge_attachment_ids, BatchDebit, LedgerStore};
use crate::{non_blank, Account, CreditTransaction};
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to resolve billing account: {0}")]
    Lookup(#[source] anyhow::Error),

    #[error("failed to write balance for {account:?}: {source}")]
    Balance {
        account: Account,
        #[source]
        source: anyhow::Error,
    },
}

/// Who asked for the images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub org_id: Option<String>,
}

/// What is being paid for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub job_id: String,
    pub production_id: Option<String>,
    pub attachment_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitReceipt {
    pub account: Option<Account>,
    pub charged: Vec<i64>,
    pub amount: i64,
    pub balance_after: Option<i64>,
}

impl DebitReceipt {
    fn nothing() -> Self {
        DebitReceipt {
            account: None,
            charged: Vec::new(),
            amount: 0,
            balance_after: None,
        }
    }
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    provider: String,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, provider: impl Into<String>) -> Self {
        CreditLedger {
            store,
            provider: provider.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Organization balance when `org_id` names an active organization,
    /// the member's own balance otherwise.
    pub async fn resolve_account(&self, actor: &Actor) -> Result<Account, LedgerError> {
        if let Some(org_id) = non_blank(actor.org_id.as_deref()) {
            let status = self
                .store
                .organization_status(org_id)
                .await
                .map_err(LedgerError::Lookup)?;
            if status.as_deref() == Some("active") {
                return Ok(Account::Organization(org_id.to_string()));
            }
            info!(org_id, ?status, "Organization not active, charging member");
        }
        Ok(Account::Member(actor.user_id.clone()))
    }

    /// Charges every attachment of `charge` not already charged for the
    /// same job, as one balance write. The charge keys commit with the
    /// balance; audit rows are best effort.
    #[instrument(
        name = "ledger.debit",
        skip(self, charge),
        fields(job_id = %charge.job_id, items = charge.attachment_ids.len())
    )]
    pub async fn debit(
        &self,
        actor: &Actor,
        charge: &Charge,
        price_per_item: i64,
    ) -> Result<DebitReceipt, LedgerError> {
        let requested = merge_attachment_ids(&[], &charge.attachment_ids);
        if requested.is_empty() {
            return Ok(DebitReceipt::nothing());
        }

        let account = self.resolve_account(actor).await?;
        let BatchDebit {
            charged,
            balance_after,
        } = self
            .store
            .debit_batch(&account, &charge.job_id, &requested, price_per_item)
            .await
            .map_err(|source| LedgerError::Balance {
                account: account.clone(),
                source,
            })?;

        let Some(balance_after) = balance_after.filter(|_| !charged.is_empty()) else {
            info!("Nothing left to charge");
            return Ok(DebitReceipt::nothing());
        };
        let amount = charged.len() as i64 * price_per_item;
        info!(?account, amount, balance_after, "Balance debited");

        let org_id = match &account {
            Account::Organization(org_id) => Some(org_id.clone()),
            Account::Member(_) => None,
        };
        for attachment_id in &charged {
            let transaction = CreditTransaction {
                user_id: actor.user_id.clone(),
                org_id: org_id.clone(),
                transaction_type: "debit".to_string(),
                amount: -price_per_item,
                balance_after,
                description: "Generated With Image".to_string(),
                attachment_id: *attachment_id,
                job_id: charge.job_id.clone(),
                production_id: charge.production_id.clone(),
                api_provider: self.provider.clone(),
            };
            if let Err(err) = self.store.append_transaction(&transaction).await {
                warn!(attachment_id, error = %err, "Failed to record credit transaction");
            }
        }

        Ok(DebitReceipt {
            account: Some(account),
            charged,
            amount,
            balance_after: Some(balance_after),
        })
    }
}

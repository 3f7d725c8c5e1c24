use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use super::models::{CreditAccount, CreditTransaction, LedgerApplied, LedgerAudit, LedgerEntry};
use crate::jobs::{GenerationJob, NewGenerationJob};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredits { balance, required } => {
                LedgerError::InsufficientCredits { balance, required }
            }
            StoreError::InvalidEntry(reason) => LedgerError::InvalidAmount(reason),
            other => LedgerError::Store(other),
        }
    }
}

/// key: ledger-service -> debit,refund,grant over the append-only log
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn Store>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn account(&self, owner_id: Uuid) -> Result<CreditAccount, LedgerError> {
        Ok(self
            .store
            .account(owner_id)
            .await?
            .unwrap_or_else(|| CreditAccount::empty(owner_id, Utc::now())))
    }

    pub async fn balance(&self, owner_id: Uuid) -> Result<i64, LedgerError> {
        Ok(self.account(owner_id).await?.balance)
    }

    pub async fn history(
        &self,
        owner_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        Ok(self.store.transactions(owner_id, limit.clamp(1, 500)).await?)
    }

    pub async fn debit(
        &self,
        owner_id: Uuid,
        amount: i64,
        related_job_id: Uuid,
    ) -> Result<i64, LedgerError> {
        let applied = self
            .store
            .apply_ledger_entry(LedgerEntry::debit(owner_id, amount, related_job_id))
            .await?;
        Ok(applied.balance())
    }

    /// Refund credits for a job. A second refund for the same job returns the
    /// current balance without writing anything.
    pub async fn refund(
        &self,
        owner_id: Uuid,
        amount: i64,
        related_job_id: Uuid,
        reason: &str,
    ) -> Result<LedgerApplied, LedgerError> {
        let applied = self
            .store
            .apply_ledger_entry(LedgerEntry::refund(owner_id, amount, related_job_id, reason))
            .await
            .map_err(|err| {
                error!(
                    target: "ledger",
                    %owner_id,
                    job_id = %related_job_id,
                    amount,
                    ?err,
                    "refund failed; needs manual compensation"
                );
                err
            })?;
        match &applied {
            LedgerApplied::Recorded(tx) => info!(
                target: "ledger",
                %owner_id,
                job_id = %related_job_id,
                amount,
                balance = tx.balance_after,
                "refund recorded"
            ),
            LedgerApplied::AlreadyRefunded { .. } => info!(
                target: "ledger",
                %owner_id,
                job_id = %related_job_id,
                "refund already recorded; skipping"
            ),
        }
        Ok(applied)
    }

    pub async fn grant(
        &self,
        owner_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<CreditTransaction, LedgerError> {
        match self
            .store
            .apply_ledger_entry(LedgerEntry::grant(owner_id, amount, reason))
            .await?
        {
            LedgerApplied::Recorded(tx) => {
                info!(target: "ledger", %owner_id, amount, reason, "credits granted");
                Ok(tx)
            }
            LedgerApplied::AlreadyRefunded { .. } => Err(LedgerError::InvalidAmount(
                "grant was not recorded".to_string(),
            )),
        }
    }

    /// Debit the job's reservation and create its row in one commit, so a
    /// debit never exists without its job.
    pub async fn reserve_for_job(
        &self,
        job: NewGenerationJob,
    ) -> Result<(GenerationJob, CreditTransaction), LedgerError> {
        let (job, tx) = self.store.reserve_and_create_job(job).await?;
        info!(
            target: "ledger",
            owner_id = %job.owner_id,
            job_id = %job.id,
            amount = tx.amount,
            balance = tx.balance_after,
            "credits reserved for generation"
        );
        Ok((job, tx))
    }

    pub async fn audit(&self, owner_id: Uuid) -> Result<LedgerAudit, LedgerError> {
        let audit = self.store.audit(owner_id).await?;
        if !audit.is_consistent() {
            error!(
                target: "ledger",
                %owner_id,
                cached = audit.cached_balance,
                reconstructed = audit.reconstructed_balance(),
                "cached balance diverges from transaction log"
            );
        }
        Ok(audit)
    }
}

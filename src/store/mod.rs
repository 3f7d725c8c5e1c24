//! Persistence seam for the generation core.
//!
//! Every method is a single atomic unit: implementations must make the
//! account row, its transaction log and (where a job write carries a refund)
//! the job row change together or not at all. Job writes are
//! compare-and-set on the row version.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::jobs::{GenerationJob, JobState, JobUpdate, NewGenerationJob};
use crate::ledger::{CreditAccount, CreditTransaction, LedgerApplied, LedgerAudit, LedgerEntry};
use crate::pricing::{PricingConfig, VideoModel};
use crate::webhooks::{EventKey, ProcessedEvent};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },
    #[error("invalid ledger entry: {0}")]
    InvalidEntry(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("illegal job transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a versioned job write.
#[derive(Debug, Clone)]
pub enum JobCommit {
    Committed {
        job: GenerationJob,
        refund: Option<LedgerApplied>,
    },
    /// The row moved on (version changed or it is already terminal).
    Stale,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn account(&self, owner_id: Uuid) -> StoreResult<Option<CreditAccount>>;

    async fn transactions(&self, owner_id: Uuid, limit: i64) -> StoreResult<Vec<CreditTransaction>>;

    async fn audit(&self, owner_id: Uuid) -> StoreResult<LedgerAudit>;

    /// Append one ledger entry and move the cached balance with it. Debits
    /// fail with `InsufficientCredits`; a second refund for a job is a no-op.
    async fn apply_ledger_entry(&self, entry: LedgerEntry) -> StoreResult<LedgerApplied>;

    /// Debit `credits_reserved` and insert the Pending job in one commit.
    async fn reserve_and_create_job(
        &self,
        job: NewGenerationJob,
    ) -> StoreResult<(GenerationJob, CreditTransaction)>;

    async fn job(&self, job_id: Uuid) -> StoreResult<Option<GenerationJob>>;

    async fn job_by_external_id(&self, external_job_id: &str) -> StoreResult<Option<GenerationJob>>;

    /// Write `update` if the row is still at `expected_version` and not
    /// terminal. A refund requested by the update commits with it.
    async fn commit_job_update(
        &self,
        job_id: Uuid,
        expected_version: i64,
        update: JobUpdate,
    ) -> StoreResult<JobCommit>;

    /// Jobs in `state` whose reference timestamp is older than `cutoff`:
    /// `processing_started_at` for Processing, `created_at` otherwise.
    async fn stale_jobs(&self, state: JobState, cutoff: DateTime<Utc>) -> StoreResult<Vec<GenerationJob>>;

    /// Pending jobs that were never handed to the provider.
    async fn undispatched_jobs(&self) -> StoreResult<Vec<GenerationJob>>;

    /// Processing jobs already accepted by the provider.
    async fn in_flight_jobs(&self) -> StoreResult<Vec<GenerationJob>>;

    /// Debits older than `cutoff` whose related job row does not exist.
    async fn orphaned_debits(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<CreditTransaction>>;

    async fn processed_event(&self, key: &EventKey) -> StoreResult<Option<ProcessedEvent>>;

    /// Insert or overwrite the record for `event.key`.
    async fn record_processed_event(&self, event: &ProcessedEvent) -> StoreResult<()>;

    async fn model(&self, model_ref: &str) -> StoreResult<Option<VideoModel>>;

    async fn pricing_snapshot(&self) -> StoreResult<PricingConfig>;
}

/// Ledger rule shared by both stores: validate `entry` against the current
/// balance and the refund guard, returning the row to append.
pub(crate) fn plan_ledger_entry(
    entry: LedgerEntry,
    balance: i64,
    existing_refund: bool,
    now: DateTime<Utc>,
) -> StoreResult<Option<CreditTransaction>> {
    use crate::ledger::TransactionKind;

    if entry.amount <= 0 {
        return Err(StoreError::InvalidEntry(format!(
            "{} amount must be positive, got {}",
            entry.kind, entry.amount
        )));
    }
    match entry.kind {
        TransactionKind::Debit if balance < entry.amount => Err(StoreError::InsufficientCredits {
            balance,
            required: entry.amount,
        }),
        TransactionKind::Refund if entry.related_job_id.is_none() => Err(StoreError::InvalidEntry(
            "refund must reference a job".to_string(),
        )),
        TransactionKind::Refund if existing_refund => Ok(None),
        _ => {
            let balance_after = balance
                .checked_add(entry.kind.signed(entry.amount))
                .ok_or_else(|| {
                    StoreError::InvalidEntry(format!(
                        "{} of {} would overflow balance {balance}",
                        entry.kind, entry.amount
                    ))
                })?;
            Ok(Some(entry.into_transaction(balance, balance_after, now)))
        }
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{plan_ledger_entry, JobCommit, Store, StoreError, StoreResult};
use crate::jobs::{GenerationJob, JobState, JobUpdate, NewGenerationJob, Resolution};
use crate::ledger::{
    CreditAccount, CreditTransaction, LedgerApplied, LedgerAudit, LedgerEntry, TransactionKind,
};
use crate::pricing::{BoundedSetting, PricingConfig, VideoModel};
use crate::webhooks::{EventKey, ProcessedEvent};

/// key: pg-store -> row locks + versioned job writes
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct AccountRow {
    owner_id: Uuid,
    balance: i64,
    total_debited: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for CreditAccount {
    fn from(row: AccountRow) -> Self {
        CreditAccount {
            owner_id: row.owner_id,
            balance: row.balance,
            total_debited: row.total_debited,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    owner_id: Uuid,
    kind: String,
    amount: i64,
    related_job_id: Option<Uuid>,
    reason: Option<String>,
    balance_before: i64,
    balance_after: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(CreditTransaction {
            id: row.id,
            owner_id: row.owner_id,
            kind: row.kind.parse().map_err(StoreError::Corrupt)?,
            amount: row.amount,
            related_job_id: row.related_job_id,
            reason: row.reason,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    owner_id: Uuid,
    prompt: String,
    model_ref: String,
    duration_seconds: i32,
    resolution: String,
    state: String,
    credits_reserved: i64,
    external_job_id: Option<String>,
    output_ref: Option<String>,
    error_message: Option<String>,
    request_params: Value,
    created_at: DateTime<Utc>,
    processing_started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<JobRow> for GenerationJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(GenerationJob {
            id: row.id,
            owner_id: row.owner_id,
            prompt: row.prompt,
            model_ref: row.model_ref,
            duration_seconds: row.duration_seconds,
            resolution: row.resolution.parse().map_err(StoreError::Corrupt)?,
            state: row.state.parse().map_err(StoreError::Corrupt)?,
            credits_reserved: row.credits_reserved,
            external_job_id: row.external_job_id,
            output_ref: row.output_ref,
            error_message: row.error_message,
            request_params: row.request_params,
            created_at: row.created_at,
            processing_started_at: row.processing_started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    external_event_id: String,
    source: String,
    processed: bool,
    processed_at: DateTime<Utc>,
    error_message: Option<String>,
    metadata: Value,
    attempts: i32,
}

impl From<EventRow> for ProcessedEvent {
    fn from(row: EventRow) -> Self {
        ProcessedEvent {
            key: EventKey::new(row.external_event_id, row.source),
            processed: row.processed,
            processed_at: row.processed_at,
            error_message: row.error_message,
            metadata: row.metadata,
            attempts: row.attempts,
        }
    }
}

#[derive(Debug, FromRow)]
struct ModelRow {
    model_ref: String,
    display_name: String,
    provider_version: Option<String>,
    active: bool,
    min_tier: String,
    default_cost_per_second: Option<Decimal>,
    max_duration_seconds: i32,
}

impl TryFrom<ModelRow> for VideoModel {
    type Error = StoreError;

    fn try_from(row: ModelRow) -> Result<Self, Self::Error> {
        Ok(VideoModel {
            model_ref: row.model_ref,
            display_name: row.display_name,
            provider_version: row.provider_version,
            active: row.active,
            min_tier: row.min_tier.parse().map_err(StoreError::Corrupt)?,
            default_cost_per_second: row.default_cost_per_second,
            max_duration_seconds: row.max_duration_seconds,
        })
    }
}

/// Lock the owner's account row, append the entry and move the balance.
async fn apply_entry_tx(
    tx: &mut Transaction<'_, Postgres>,
    entry: LedgerEntry,
) -> StoreResult<LedgerApplied> {
    sqlx::query("INSERT INTO credit_accounts (owner_id) VALUES ($1) ON CONFLICT (owner_id) DO NOTHING")
        .bind(entry.owner_id)
        .execute(&mut *tx)
        .await?;

    let balance: i64 =
        sqlx::query_scalar("SELECT balance FROM credit_accounts WHERE owner_id = $1 FOR UPDATE")
            .bind(entry.owner_id)
            .fetch_one(&mut *tx)
            .await?;

    let existing_refund = match (entry.kind, entry.related_job_id) {
        (TransactionKind::Refund, Some(job_id)) => {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM credit_transactions WHERE kind = 'refund' AND related_job_id = $1)",
            )
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?
        }
        _ => false,
    };

    let Some(transaction) = plan_ledger_entry(entry, balance, existing_refund, Utc::now())? else {
        return Ok(LedgerApplied::AlreadyRefunded { balance });
    };

    sqlx::query(
        r#"
        INSERT INTO credit_transactions (
            id,
            owner_id,
            kind,
            amount,
            related_job_id,
            reason,
            balance_before,
            balance_after,
            created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(transaction.id)
    .bind(transaction.owner_id)
    .bind(transaction.kind.as_str())
    .bind(transaction.amount)
    .bind(transaction.related_job_id)
    .bind(&transaction.reason)
    .bind(transaction.balance_before)
    .bind(transaction.balance_after)
    .bind(transaction.created_at)
    .execute(&mut *tx)
    .await?;

    let debited = if transaction.kind == TransactionKind::Debit {
        transaction.amount
    } else {
        0
    };
    sqlx::query(
        r#"
        UPDATE credit_accounts
        SET balance = $2,
            total_debited = CASE
                WHEN total_debited > 9223372036854775807 - $3 THEN 9223372036854775807
                ELSE total_debited + $3
            END,
            updated_at = NOW()
        WHERE owner_id = $1
        "#,
    )
    .bind(transaction.owner_id)
    .bind(transaction.balance_after)
    .bind(debited)
    .execute(&mut *tx)
    .await?;

    Ok(LedgerApplied::Recorded(transaction))
}

fn required_setting(
    settings: &HashMap<String, (Decimal, Option<Decimal>, Option<Decimal>)>,
    key: &str,
) -> StoreResult<(Decimal, Option<Decimal>, Option<Decimal>)> {
    settings
        .get(key)
        .copied()
        .ok_or(StoreError::NotFound("pricing setting"))
}

fn bounded(
    settings: &HashMap<String, (Decimal, Option<Decimal>, Option<Decimal>)>,
    key: &str,
) -> StoreResult<BoundedSetting> {
    let (value, min, max) = required_setting(settings, key)?;
    match (min, max) {
        (Some(min), Some(max)) => Ok(BoundedSetting::new(value, min, max)),
        _ => Err(StoreError::NotFound("pricing setting bounds")),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn account(&self, owner_id: Uuid) -> StoreResult<Option<CreditAccount>> {
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM credit_accounts WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(CreditAccount::from))
    }

    async fn transactions(&self, owner_id: Uuid, limit: i64) -> StoreResult<Vec<CreditTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM credit_transactions WHERE owner_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(owner_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CreditTransaction::try_from).collect()
    }

    async fn audit(&self, owner_id: Uuid) -> StoreResult<LedgerAudit> {
        let (cached_balance, granted, refunded, debited): (Option<i64>, Option<Decimal>, Option<Decimal>, Option<Decimal>) =
            sqlx::query_as(
                r#"
                SELECT
                    (SELECT balance FROM credit_accounts WHERE owner_id = $1),
                    (SELECT SUM(amount) FROM credit_transactions WHERE owner_id = $1 AND kind = 'grant'),
                    (SELECT SUM(amount) FROM credit_transactions WHERE owner_id = $1 AND kind = 'refund'),
                    (SELECT SUM(amount) FROM credit_transactions WHERE owner_id = $1 AND kind = 'debit')
                "#,
            )
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;

        let total = |sum: Option<Decimal>| sum.and_then(|value| value.to_i64()).unwrap_or(0);
        Ok(LedgerAudit {
            owner_id,
            cached_balance: cached_balance.unwrap_or(0),
            granted: total(granted),
            refunded: total(refunded),
            debited: total(debited),
        })
    }

    async fn apply_ledger_entry(&self, entry: LedgerEntry) -> StoreResult<LedgerApplied> {
        let mut tx = self.pool.begin().await?;
        let applied = apply_entry_tx(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(applied)
    }

    async fn reserve_and_create_job(
        &self,
        job: NewGenerationJob,
    ) -> StoreResult<(GenerationJob, CreditTransaction)> {
        let mut tx = self.pool.begin().await?;
        let debit = LedgerEntry::debit(job.owner_id, job.credits_reserved, job.id);
        let LedgerApplied::Recorded(transaction) = apply_entry_tx(&mut tx, debit).await? else {
            return Err(StoreError::InvalidEntry("debit was not recorded".to_string()));
        };

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO generation_jobs (
                id,
                owner_id,
                prompt,
                model_ref,
                duration_seconds,
                resolution,
                state,
                credits_reserved,
                request_params
            ) VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(job.owner_id)
        .bind(&job.prompt)
        .bind(&job.model_ref)
        .bind(job.duration_seconds)
        .bind(job.resolution.as_str())
        .bind(job.credits_reserved)
        .bind(&job.request_params)
        .fetch_one(&mut tx)
        .await?;

        tx.commit().await?;
        Ok((GenerationJob::try_from(row)?, transaction))
    }

    async fn job(&self, job_id: Uuid) -> StoreResult<Option<GenerationJob>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM generation_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(GenerationJob::try_from)
            .transpose()
    }

    async fn job_by_external_id(&self, external_job_id: &str) -> StoreResult<Option<GenerationJob>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM generation_jobs WHERE external_job_id = $1")
            .bind(external_job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(GenerationJob::try_from)
            .transpose()
    }

    async fn commit_job_update(
        &self,
        job_id: Uuid,
        expected_version: i64,
        update: JobUpdate,
    ) -> StoreResult<JobCommit> {
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_as::<_, JobRow>("SELECT * FROM generation_jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut tx)
            .await?
            .map(GenerationJob::try_from)
            .transpose()?
            .ok_or(StoreError::NotFound("generation job"))?;

        if current.version != expected_version || current.state.is_terminal() {
            return Ok(JobCommit::Stale);
        }
        if !current.state.can_transition_to(update.state) {
            return Err(StoreError::InvalidTransition {
                from: current.state,
                to: update.state,
            });
        }

        let refund = if update.refund && current.credits_reserved > 0 {
            let reason = update
                .error_message
                .clone()
                .unwrap_or_else(|| format!("job {}", update.state));
            Some(
                apply_entry_tx(
                    &mut tx,
                    LedgerEntry::refund(current.owner_id, current.credits_reserved, job_id, reason),
                )
                .await?,
            )
        } else {
            None
        };

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE generation_jobs
            SET state = $3,
                external_job_id = COALESCE($4, external_job_id),
                output_ref = COALESCE($5, output_ref),
                error_message = COALESCE($6, error_message),
                processing_started_at = COALESCE(processing_started_at, $7),
                completed_at = COALESCE($8, completed_at),
                updated_at = NOW(),
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(expected_version)
        .bind(update.state.as_str())
        .bind(&update.external_job_id)
        .bind(&update.output_ref)
        .bind(&update.error_message)
        .bind(update.processing_started_at)
        .bind(update.completed_at)
        .fetch_optional(&mut tx)
        .await?;

        let Some(row) = row else {
            return Ok(JobCommit::Stale);
        };
        tx.commit().await?;
        Ok(JobCommit::Committed {
            job: GenerationJob::try_from(row)?,
            refund,
        })
    }

    async fn stale_jobs(&self, state: JobState, cutoff: DateTime<Utc>) -> StoreResult<Vec<GenerationJob>> {
        let query = match state {
            JobState::Processing => {
                "SELECT * FROM generation_jobs WHERE state = $1 AND COALESCE(processing_started_at, created_at) < $2 ORDER BY created_at"
            }
            _ => "SELECT * FROM generation_jobs WHERE state = $1 AND created_at < $2 ORDER BY created_at",
        };
        sqlx::query_as::<_, JobRow>(query)
            .bind(state.as_str())
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(GenerationJob::try_from)
            .collect()
    }

    async fn undispatched_jobs(&self) -> StoreResult<Vec<GenerationJob>> {
        sqlx::query_as::<_, JobRow>(
            "SELECT * FROM generation_jobs WHERE state = 'pending' AND external_job_id IS NULL ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(GenerationJob::try_from)
        .collect()
    }

    async fn in_flight_jobs(&self) -> StoreResult<Vec<GenerationJob>> {
        sqlx::query_as::<_, JobRow>(
            "SELECT * FROM generation_jobs WHERE state = 'processing' AND external_job_id IS NOT NULL ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(GenerationJob::try_from)
        .collect()
    }

    async fn orphaned_debits(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<CreditTransaction>> {
        sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT t.*
            FROM credit_transactions t
            WHERE t.kind = 'debit'
              AND t.created_at < $1
              AND t.related_job_id IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM generation_jobs j WHERE j.id = t.related_job_id)
              AND NOT EXISTS (
                  SELECT 1 FROM credit_transactions r
                  WHERE r.kind = 'refund' AND r.related_job_id = t.related_job_id
              )
            ORDER BY t.created_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(CreditTransaction::try_from)
        .collect()
    }

    async fn processed_event(&self, key: &EventKey) -> StoreResult<Option<ProcessedEvent>> {
        let row = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM processed_events WHERE external_event_id = $1 AND source = $2",
        )
        .bind(&key.external_event_id)
        .bind(&key.source)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProcessedEvent::from))
    }

    async fn record_processed_event(&self, event: &ProcessedEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (
                external_event_id,
                source,
                processed,
                processed_at,
                error_message,
                metadata,
                attempts
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_event_id, source)
            DO UPDATE SET
                processed = EXCLUDED.processed,
                processed_at = EXCLUDED.processed_at,
                error_message = EXCLUDED.error_message,
                metadata = EXCLUDED.metadata,
                attempts = EXCLUDED.attempts
            "#,
        )
        .bind(&event.key.external_event_id)
        .bind(&event.key.source)
        .bind(event.processed)
        .bind(event.processed_at)
        .bind(&event.error_message)
        .bind(&event.metadata)
        .bind(event.attempts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn model(&self, model_ref: &str) -> StoreResult<Option<VideoModel>> {
        sqlx::query_as::<_, ModelRow>(
            r#"
            SELECT model_ref, display_name, provider_version, active, min_tier,
                   default_cost_per_second, max_duration_seconds
            FROM video_models
            WHERE model_ref = $1
            "#,
        )
        .bind(model_ref)
        .fetch_optional(&self.pool)
        .await?
        .map(VideoModel::try_from)
        .transpose()
    }

    async fn pricing_snapshot(&self) -> StoreResult<PricingConfig> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut tx)
            .await?;

        let settings: HashMap<String, (Decimal, Option<Decimal>, Option<Decimal>)> =
            sqlx::query_as::<_, (String, Decimal, Option<Decimal>, Option<Decimal>)>(
                "SELECT key, value, min_value, max_value FROM pricing_settings",
            )
            .fetch_all(&mut tx)
            .await?
            .into_iter()
            .map(|(key, value, min, max)| (key, (value, min, max)))
            .collect();

        let mut resolution_multipliers = HashMap::new();
        for (resolution, multiplier) in sqlx::query_as::<_, (String, Decimal)>(
            "SELECT resolution, multiplier FROM resolution_multipliers",
        )
        .fetch_all(&mut tx)
        .await?
        {
            let resolution: Resolution = resolution.parse().map_err(StoreError::Corrupt)?;
            resolution_multipliers.insert(resolution, multiplier);
        }

        let mut resolution_costs = HashMap::new();
        for (model_ref, resolution, cost) in sqlx::query_as::<_, (String, String, Decimal)>(
            "SELECT model_ref, resolution, cost_per_second FROM model_resolution_costs",
        )
        .fetch_all(&mut tx)
        .await?
        {
            let resolution: Resolution = resolution.parse().map_err(StoreError::Corrupt)?;
            resolution_costs.insert((model_ref, resolution), cost);
        }
        tx.commit().await?;

        let (max_cost_per_second, _, _) = required_setting(&settings, "max_cost_per_second")?;
        let (max_credits_per_job, _, _) = required_setting(&settings, "max_credits_per_job")?;
        Ok(PricingConfig {
            resolution_costs,
            resolution_multipliers,
            profit_margin: bounded(&settings, "profit_margin")?,
            credits_per_dollar: bounded(&settings, "credits_per_dollar")?,
            max_cost_per_second,
            max_credits_per_job: max_credits_per_job.to_i64().ok_or_else(|| {
                StoreError::Corrupt("max_credits_per_job is not an integer".to_string())
            })?,
        })
    }
}

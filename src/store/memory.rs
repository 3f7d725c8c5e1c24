use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{plan_ledger_entry, JobCommit, Store, StoreError, StoreResult};
use crate::jobs::{EntitlementTier, GenerationJob, JobState, JobUpdate, NewGenerationJob, Resolution};
use crate::ledger::{
    CreditAccount, CreditTransaction, LedgerApplied, LedgerAudit, LedgerEntry, TransactionKind,
};
use crate::pricing::{BoundedSetting, PricingConfig, VideoModel};
use crate::webhooks::{EventKey, ProcessedEvent};

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<Uuid, CreditAccount>,
    transactions: Vec<CreditTransaction>,
    jobs: HashMap<Uuid, GenerationJob>,
    events: HashMap<EventKey, ProcessedEvent>,
    models: HashMap<String, VideoModel>,
    pricing: Option<PricingConfig>,
}

impl MemoryState {
    fn has_refund_for(&self, job_id: Option<Uuid>) -> bool {
        job_id.is_some()
            && self
                .transactions
                .iter()
                .any(|tx| tx.kind == TransactionKind::Refund && tx.related_job_id == job_id)
    }

    fn apply_entry(&mut self, entry: LedgerEntry, now: DateTime<Utc>) -> StoreResult<LedgerApplied> {
        let owner_id = entry.owner_id;
        let existing_refund =
            entry.kind == TransactionKind::Refund && self.has_refund_for(entry.related_job_id);
        let balance = self
            .accounts
            .get(&owner_id)
            .map(|account| account.balance)
            .unwrap_or(0);

        let Some(transaction) = plan_ledger_entry(entry, balance, existing_refund, now)? else {
            return Ok(LedgerApplied::AlreadyRefunded { balance });
        };

        let account = self
            .accounts
            .entry(owner_id)
            .or_insert_with(|| CreditAccount::empty(owner_id, now));
        account.balance = transaction.balance_after;
        if transaction.kind == TransactionKind::Debit {
            account.total_debited = account.total_debited.saturating_add(transaction.amount);
        }
        account.updated_at = now;
        self.transactions.push(transaction.clone());
        Ok(LedgerApplied::Recorded(transaction))
    }
}

/// key: memory-store -> single-mutex store for tests and demo deployments
///
/// Every trait method holds the one lock for its whole body, which gives the
/// same all-or-nothing behaviour the Postgres store gets from transactions.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(models: Vec<VideoModel>, pricing: PricingConfig) -> Self {
        let state = MemoryState {
            models: models
                .into_iter()
                .map(|model| (model.model_ref.clone(), model))
                .collect(),
            pricing: Some(pricing),
            ..MemoryState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Two models and a pricing table good enough to run the service locally.
    pub fn with_demo_catalog() -> Self {
        let models = vec![
            VideoModel {
                model_ref: "acme/motion-v2".to_string(),
                display_name: "Motion v2".to_string(),
                provider_version: None,
                active: true,
                min_tier: EntitlementTier::Free,
                default_cost_per_second: Some(dec!(0.12)),
                max_duration_seconds: 60,
            },
            VideoModel {
                model_ref: "acme/cinema-xl".to_string(),
                display_name: "Cinema XL".to_string(),
                provider_version: None,
                active: true,
                min_tier: EntitlementTier::Pro,
                default_cost_per_second: Some(dec!(0.30)),
                max_duration_seconds: 300,
            },
        ];
        let pricing = PricingConfig {
            resolution_costs: HashMap::from([(
                ("acme/cinema-xl".to_string(), Resolution::FullHd1080),
                dec!(0.45),
            )]),
            resolution_multipliers: HashMap::from([
                (Resolution::Sd480, dec!(0.75)),
                (Resolution::Hd720, dec!(1.0)),
                (Resolution::FullHd1080, dec!(1.5)),
            ]),
            profit_margin: BoundedSetting::new(dec!(1.40), dec!(1.0), dec!(3.0)),
            credits_per_dollar: BoundedSetting::new(dec!(50), dec!(10), dec!(1000)),
            max_cost_per_second: dec!(2.0),
            max_credits_per_job: 5_000,
        };
        Self::with_catalog(models, pricing)
    }

    pub async fn set_pricing(&self, pricing: PricingConfig) {
        self.state.lock().await.pricing = Some(pricing);
    }

    pub async fn all_transactions(&self) -> Vec<CreditTransaction> {
        self.state.lock().await.transactions.clone()
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn account(&self, owner_id: Uuid) -> StoreResult<Option<CreditAccount>> {
        Ok(self.state.lock().await.accounts.get(&owner_id).cloned())
    }

    async fn transactions(&self, owner_id: Uuid, limit: i64) -> StoreResult<Vec<CreditTransaction>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(state
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.owner_id == owner_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn audit(&self, owner_id: Uuid) -> StoreResult<LedgerAudit> {
        let state = self.state.lock().await;
        let mut audit = LedgerAudit {
            owner_id,
            cached_balance: state
                .accounts
                .get(&owner_id)
                .map(|account| account.balance)
                .unwrap_or(0),
            granted: 0,
            refunded: 0,
            debited: 0,
        };
        for tx in state.transactions.iter().filter(|tx| tx.owner_id == owner_id) {
            match tx.kind {
                TransactionKind::Grant => audit.granted += tx.amount,
                TransactionKind::Refund => audit.refunded += tx.amount,
                TransactionKind::Debit => audit.debited += tx.amount,
            }
        }
        Ok(audit)
    }

    async fn apply_ledger_entry(&self, entry: LedgerEntry) -> StoreResult<LedgerApplied> {
        self.state.lock().await.apply_entry(entry, Utc::now())
    }

    async fn reserve_and_create_job(
        &self,
        job: NewGenerationJob,
    ) -> StoreResult<(GenerationJob, CreditTransaction)> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let debit = LedgerEntry::debit(job.owner_id, job.credits_reserved, job.id);
        let LedgerApplied::Recorded(transaction) = state.apply_entry(debit, now)? else {
            return Err(StoreError::InvalidEntry("debit was not recorded".to_string()));
        };
        let job = job.into_job(now);
        state.jobs.insert(job.id, job.clone());
        Ok((job, transaction))
    }

    async fn job(&self, job_id: Uuid) -> StoreResult<Option<GenerationJob>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn job_by_external_id(&self, external_job_id: &str) -> StoreResult<Option<GenerationJob>> {
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .values()
            .find(|job| job.external_job_id.as_deref() == Some(external_job_id))
            .cloned())
    }

    async fn commit_job_update(
        &self,
        job_id: Uuid,
        expected_version: i64,
        update: JobUpdate,
    ) -> StoreResult<JobCommit> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let current = state
            .jobs
            .get(&job_id)
            .cloned()
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
            Some(state.apply_entry(
                LedgerEntry::refund(current.owner_id, current.credits_reserved, job_id, reason),
                now,
            )?)
        } else {
            None
        };

        let mut job = current;
        update.apply_to(&mut job, now);
        state.jobs.insert(job_id, job.clone());
        Ok(JobCommit::Committed { job, refund })
    }

    async fn stale_jobs(&self, state: JobState, cutoff: DateTime<Utc>) -> StoreResult<Vec<GenerationJob>> {
        let guard = self.state.lock().await;
        let mut jobs: Vec<GenerationJob> = guard
            .jobs
            .values()
            .filter(|job| job.state == state)
            .filter(|job| {
                let reference = match state {
                    JobState::Processing => job.processing_started_at.unwrap_or(job.created_at),
                    _ => job.created_at,
                };
                reference < cutoff
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn undispatched_jobs(&self) -> StoreResult<Vec<GenerationJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<GenerationJob> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Pending && job.external_job_id.is_none())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn in_flight_jobs(&self) -> StoreResult<Vec<GenerationJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<GenerationJob> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Processing && job.external_job_id.is_some())
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn orphaned_debits(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<CreditTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .iter()
            .filter(|tx| tx.kind == TransactionKind::Debit && tx.created_at < cutoff)
            .filter(|tx| match tx.related_job_id {
                Some(job_id) => {
                    !state.jobs.contains_key(&job_id) && !state.has_refund_for(Some(job_id))
                }
                None => false,
            })
            .cloned()
            .collect())
    }

    async fn processed_event(&self, key: &EventKey) -> StoreResult<Option<ProcessedEvent>> {
        Ok(self.state.lock().await.events.get(key).cloned())
    }

    async fn record_processed_event(&self, event: &ProcessedEvent) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .events
            .insert(event.key.clone(), event.clone());
        Ok(())
    }

    async fn model(&self, model_ref: &str) -> StoreResult<Option<VideoModel>> {
        Ok(self.state.lock().await.models.get(model_ref).cloned())
    }

    async fn pricing_snapshot(&self) -> StoreResult<PricingConfig> {
        self.state
            .lock()
            .await
            .pricing
            .clone()
            .ok_or(StoreError::NotFound("pricing configuration"))
    }
}

//! The one place provider-reported status becomes job state.
//!
//! Webhook ingestion and the poll loop both call [`Reconciler::apply_status`];
//! the sweeper and the dispatcher use [`Reconciler::force_fail`]. Every write
//! is a compare-and-set on the job version, and any refund commits together
//! with the terminal transition, so racing callers settle on exactly one
//! outcome and at most one refund.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::jobs::{plan_transition, GenerationJob, JobState, JobUpdate, Transition};
use crate::ledger::LedgerApplied;
use crate::provider::ProviderPrediction;
use crate::retry::{retry_with, RetryPolicy};
use crate::storage::OutputArchiver;
use crate::store::{JobCommit, Store, StoreError};

const MAX_WRITE_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("generation job {0} not found")]
    JobNotFound(Uuid),
    #[error("generation job {0} kept changing underneath the reconciler")]
    Contended(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// Nothing to write: the job is terminal or already reflects the report.
    NoOp,
    Applied {
        job: GenerationJob,
        refunded: bool,
    },
}

impl ReconcileOutcome {
    pub fn job(&self) -> Option<&GenerationJob> {
        match self {
            ReconcileOutcome::NoOp => None,
            ReconcileOutcome::Applied { job, .. } => Some(job),
        }
    }
}

fn failure(state: JobState, reason: String) -> JobUpdate {
    JobUpdate {
        error_message: Some(reason),
        completed_at: Some(Utc::now()),
        refund: true,
        ..JobUpdate::to_state(state)
    }
}

/// key: completion-reconciler -> shared transition + compensation
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    archiver: Arc<dyn OutputArchiver>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, archiver: Arc<dyn OutputArchiver>, retry: RetryPolicy) -> Self {
        Self {
            store,
            archiver,
            retry,
        }
    }

    async fn load(&self, job_id: Uuid) -> Result<GenerationJob, ReconcileError> {
        self.store
            .job(job_id)
            .await?
            .ok_or(ReconcileError::JobNotFound(job_id))
    }

    /// Apply a provider report to the job. Output retrieval runs before the
    /// Completed write; if it fails the job fails and is refunded instead.
    pub async fn apply_status(
        &self,
        job_id: Uuid,
        report: &ProviderPrediction,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let job = self.load(job_id).await?;
            let update = match plan_transition(&job, report) {
                Transition::NoOp => return Ok(ReconcileOutcome::NoOp),
                Transition::MarkProcessing => JobUpdate {
                    processing_started_at: Some(Utc::now()),
                    ..JobUpdate::to_state(JobState::Processing)
                },
                Transition::Complete { output_url } => match self.archive(&job, &output_url).await {
                    Ok(output_ref) => JobUpdate {
                        output_ref: Some(output_ref),
                        completed_at: Some(Utc::now()),
                        ..JobUpdate::to_state(JobState::Completed)
                    },
                    Err(err) => failure(
                        JobState::Failed,
                        format!("output retrieval failed: {err:#}"),
                    ),
                },
                Transition::Fail { state, reason } => failure(state, reason),
            };

            if let Some(outcome) = self.commit(&job, update).await? {
                return Ok(outcome);
            }
        }
        Err(ReconcileError::Contended(job_id))
    }

    /// Fail a non-terminal job with `reason` and refund it. A job that is
    /// already terminal is left alone.
    pub async fn force_fail(
        &self,
        job_id: Uuid,
        reason: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let job = self.load(job_id).await?;
            if job.state.is_terminal() {
                return Ok(ReconcileOutcome::NoOp);
            }
            if let Some(outcome) = self
                .commit(&job, failure(JobState::Failed, reason.to_string()))
                .await?
            {
                return Ok(outcome);
            }
        }
        Err(ReconcileError::Contended(job_id))
    }

    /// Record the provider's id and move the job to Processing. A job that
    /// left Pending meanwhile (e.g. swept) is not touched.
    pub async fn mark_dispatched(
        &self,
        job_id: Uuid,
        external_job_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let job = self.load(job_id).await?;
            if job.state != JobState::Pending || job.external_job_id.is_some() {
                warn!(
                    target: "generation.dispatch",
                    %job_id,
                    external_job_id,
                    state = %job.state,
                    "job moved on before dispatch was recorded"
                );
                return Ok(ReconcileOutcome::NoOp);
            }
            let update = JobUpdate {
                external_job_id: Some(external_job_id.to_string()),
                processing_started_at: Some(Utc::now()),
                ..JobUpdate::to_state(JobState::Processing)
            };
            if let Some(outcome) = self.commit(&job, update).await? {
                return Ok(outcome);
            }
        }
        Err(ReconcileError::Contended(job_id))
    }

    async fn archive(&self, job: &GenerationJob, output_url: &str) -> anyhow::Result<String> {
        retry_with(&self.retry, "storage.archive_output", |_| true, || {
            self.archiver.archive(job, output_url)
        })
        .await
    }

    /// `None` when the row moved on and the caller should re-plan.
    async fn commit(
        &self,
        job: &GenerationJob,
        update: JobUpdate,
    ) -> Result<Option<ReconcileOutcome>, ReconcileError> {
        let next_state = update.state;
        let commit = self
            .store
            .commit_job_update(job.id, job.version, update)
            .await
            .map_err(|err| {
                if next_state.is_terminal() && job.credits_reserved > 0 {
                    error!(
                        target: "ledger",
                        owner_id = %job.owner_id,
                        job_id = %job.id,
                        amount = job.credits_reserved,
                        ?err,
                        "terminal transition failed; refund not recorded"
                    );
                }
                err
            })?;

        match commit {
            JobCommit::Stale => {
                info!(target: "generation.reconcile", job_id = %job.id, version = job.version, "job version moved; re-planning");
                Ok(None)
            }
            JobCommit::Committed { job, refund } => {
                let refunded = matches!(refund, Some(LedgerApplied::Recorded(_)));
                match job.state {
                    JobState::Completed => info!(
                        target: "generation.reconcile",
                        job_id = %job.id,
                        output_ref = job.output_ref.as_deref().unwrap_or_default(),
                        "generation completed"
                    ),
                    JobState::Failed | JobState::Canceled => warn!(
                        target: "generation.reconcile",
                        job_id = %job.id,
                        owner_id = %job.owner_id,
                        state = %job.state,
                        error = job.error_message.as_deref().unwrap_or_default(),
                        refunded,
                        "generation did not complete"
                    ),
                    _ => info!(
                        target: "generation.reconcile",
                        job_id = %job.id,
                        state = %job.state,
                        "generation progressed"
                    ),
                }
                Ok(Some(ReconcileOutcome::Applied { job, refunded }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{NewGenerationJob, Resolution};
    use crate::ledger::{LedgerEntry, TransactionKind};
    use crate::provider::ProviderStatus;
    use crate::store::MemoryStore;
    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubArchiver {
        fail: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl OutputArchiver for StubArchiver {
        async fn archive(&self, job: &GenerationJob, _source_url: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("storage offline");
            }
            Ok(crate::storage::output_key(job.owner_id, job.id))
        }
    }

    async fn setup(fail_archive: bool) -> (Arc<MemoryStore>, Arc<StubArchiver>, Reconciler, GenerationJob) {
        let store = Arc::new(MemoryStore::new());
        let archiver = Arc::new(StubArchiver {
            fail: fail_archive,
            calls: AtomicU32::new(0),
        });
        let owner = Uuid::new_v4();
        store
            .apply_ledger_entry(LedgerEntry::grant(owner, 100, "seed"))
            .await
            .unwrap();
        let (job, _) = store
            .reserve_and_create_job(NewGenerationJob {
                id: Uuid::new_v4(),
                owner_id: owner,
                prompt: "a fox in snow".to_string(),
                model_ref: "acme/motion-v2".to_string(),
                duration_seconds: 5,
                resolution: Resolution::Hd720,
                credits_reserved: 42,
                request_params: json!({}),
            })
            .await
            .unwrap();
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(1),
        };
        let reconciler = Reconciler::new(store.clone(), archiver.clone(), retry);
        (store, archiver, reconciler, job)
    }

    fn report(status: ProviderStatus, output: Option<Value>) -> ProviderPrediction {
        ProviderPrediction {
            id: "pred-1".to_string(),
            status,
            output,
            error: None,
        }
    }

    async fn refunds(store: &MemoryStore, job_id: Uuid) -> usize {
        store
            .all_transactions()
            .await
            .iter()
            .filter(|tx| tx.kind == TransactionKind::Refund && tx.related_job_id == Some(job_id))
            .count()
    }

    #[tokio::test]
    async fn success_archives_and_completes() {
        let (store, archiver, reconciler, job) = setup(false).await;
        let outcome = reconciler
            .apply_status(
                job.id,
                &report(ProviderStatus::Succeeded, Some(json!("https://cdn.example/v.mp4"))),
            )
            .await
            .unwrap();

        let job = outcome.job().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.output_ref.as_deref().unwrap().starts_with("generations/"));
        assert_eq!(archiver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(refunds(&store, job.id).await, 0);
    }

    #[tokio::test]
    async fn archive_failure_fails_and_refunds() {
        let (store, archiver, reconciler, job) = setup(true).await;
        let outcome = reconciler
            .apply_status(
                job.id,
                &report(ProviderStatus::Succeeded, Some(json!("https://cdn.example/v.mp4"))),
            )
            .await
            .unwrap();

        let ReconcileOutcome::Applied { job, refunded } = outcome else {
            panic!("expected a write");
        };
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error_message.unwrap().contains("output retrieval failed"));
        assert!(refunded);
        assert_eq!(archiver.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.account(job.owner_id).await.unwrap().unwrap().balance, 100);
    }

    #[tokio::test]
    async fn repeated_failure_refunds_once() {
        let (store, _, reconciler, job) = setup(false).await;
        let failed = report(ProviderStatus::Failed, None);

        reconciler.apply_status(job.id, &failed).await.unwrap();
        let second = reconciler.apply_status(job.id, &failed).await.unwrap();
        let forced = reconciler.force_fail(job.id, "timed out").await.unwrap();

        assert!(matches!(second, ReconcileOutcome::NoOp));
        assert!(matches!(forced, ReconcileOutcome::NoOp));
        assert_eq!(refunds(&store, job.id).await, 1);
        assert_eq!(store.account(job.owner_id).await.unwrap().unwrap().balance, 100);
    }

    #[tokio::test]
    async fn racing_terminal_reports_settle_once() {
        let (store, _, reconciler, job) = setup(false).await;
        let failed = report(ProviderStatus::Failed, None);
        let canceled = report(ProviderStatus::Canceled, None);

        let (a, b, c) = tokio::join!(
            reconciler.apply_status(job.id, &failed),
            reconciler.apply_status(job.id, &canceled),
            reconciler.force_fail(job.id, "swept"),
        );
        let applied = [a.unwrap(), b.unwrap(), c.unwrap()]
            .iter()
            .filter(|outcome| matches!(outcome, ReconcileOutcome::Applied { .. }))
            .count();

        assert_eq!(applied, 1);
        assert_eq!(refunds(&store, job.id).await, 1);
    }

    #[tokio::test]
    async fn dispatch_marks_processing_with_external_id() {
        let (store, _, reconciler, job) = setup(false).await;
        reconciler.mark_dispatched(job.id, "pred-1").await.unwrap();

        let stored = store.job_by_external_id("pred-1").await.unwrap().unwrap();
        assert_eq!(stored.id, job.id);
        assert_eq!(stored.state, JobState::Processing);
        assert!(stored.processing_started_at.is_some());

        let again = reconciler.mark_dispatched(job.id, "pred-2").await.unwrap();
        assert!(matches!(again, ReconcileOutcome::NoOp));
    }

    #[tokio::test]
    async fn progress_report_on_processing_job_is_noop() {
        let (_, _, reconciler, job) = setup(false).await;
        reconciler.mark_dispatched(job.id, "pred-1").await.unwrap();
        let outcome = reconciler
            .apply_status(job.id, &report(ProviderStatus::Processing, None))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::NoOp));
    }
}

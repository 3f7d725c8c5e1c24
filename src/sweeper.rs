use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{info, warn};

use crate::config;
use crate::jobs::JobState;
use crate::ledger::CreditLedger;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub interval: TokioDuration,
    pub processing_max_age: Duration,
    pub pending_max_age: Duration,
}

impl SweepSettings {
    pub fn from_env() -> Self {
        Self {
            interval: TokioDuration::from_secs(*config::SWEEP_INTERVAL_SECS),
            processing_max_age: Duration::seconds(*config::STALE_JOB_MAX_AGE_SECS),
            pending_max_age: Duration::seconds(*config::PENDING_JOB_MAX_AGE_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub timed_out: usize,
    pub orphan_refunds: usize,
}

/// key: stale-job-sweeper -> outer bound on non-terminal jobs
#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn Store>,
    reconciler: Reconciler,
    ledger: CreditLedger,
    settings: SweepSettings,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn Store>,
        reconciler: Reconciler,
        ledger: CreditLedger,
        settings: SweepSettings,
    ) -> Self {
        Self {
            store,
            reconciler,
            ledger,
            settings,
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.settings.interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep_once(Utc::now()).await {
                    warn!(?err, "stale job sweep failed");
                }
            }
        });
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let stuck = [
            (
                JobState::Processing,
                self.settings.processing_max_age,
                "generation timed out while processing",
            ),
            (
                JobState::Pending,
                self.settings.pending_max_age,
                "generation was never dispatched",
            ),
        ];
        for (state, max_age, reason) in stuck {
            for job in self.store.stale_jobs(state, now - max_age).await? {
                match self.reconciler.force_fail(job.id, reason).await {
                    Ok(ReconcileOutcome::Applied { .. }) => {
                        report.timed_out += 1;
                        info!(job_id = %job.id, %state, "swept stale generation job");
                    }
                    Ok(ReconcileOutcome::NoOp) => {}
                    Err(err) => warn!(job_id = %job.id, ?err, "failed to sweep stale job"),
                }
            }
        }

        for debit in self
            .store
            .orphaned_debits(now - self.settings.pending_max_age)
            .await?
        {
            let Some(job_id) = debit.related_job_id else {
                continue;
            };
            match self
                .ledger
                .refund(debit.owner_id, debit.amount, job_id, "debit without a generation job")
                .await
            {
                Ok(applied) if applied.is_recorded() => report.orphan_refunds += 1,
                Ok(_) => {}
                Err(err) => warn!(%job_id, ?err, "failed to refund orphaned debit"),
            }
        }

        if report != SweepReport::default() {
            info!(
                timed_out = report.timed_out,
                orphan_refunds = report.orphan_refunds,
                "stale job sweep finished"
            );
        }
        Ok(report)
    }
}

use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config;
use crate::provider::VideoProvider;
use crate::reconciler::Reconciler;
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl PollSettings {
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_secs(*config::POLL_INTERVAL_SECS),
            retry_delay: Duration::from_secs(*config::POLL_RETRY_DELAY_SECS),
            max_attempts: *config::POLL_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// Poll again after the delay.
    Continue(Duration),
    Done,
}

/// key: poll-fallback -> status polling when no callback is registered
#[derive(Clone)]
pub struct Poller {
    store: Arc<dyn Store>,
    provider: Arc<dyn VideoProvider>,
    reconciler: Reconciler,
    settings: PollSettings,
}

impl Poller {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn VideoProvider>,
        reconciler: Reconciler,
        settings: PollSettings,
    ) -> Self {
        Self {
            store,
            provider,
            reconciler,
            settings,
        }
    }

    /// One status query fed through the reconciler.
    pub async fn tick(&self, job_id: Uuid, external_job_id: &str) -> PollStep {
        match self.store.job(job_id).await {
            Ok(Some(job)) if job.state.is_terminal() => {
                debug!(target: "generation.poll", %job_id, state = %job.state, "job settled elsewhere; polling stops");
                return PollStep::Done;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(target: "generation.poll", %job_id, "polled job no longer exists");
                return PollStep::Done;
            }
            Err(err) => {
                warn!(target: "generation.poll", %job_id, ?err, "failed to load job before polling");
                return PollStep::Continue(self.settings.retry_delay);
            }
        }

        let report = match self.provider.get_prediction(external_job_id).await {
            Ok(report) => report,
            Err(err) => {
                warn!(
                    target: "generation.poll",
                    %job_id,
                    external_job_id,
                    error = %err,
                    "status poll failed; retrying later"
                );
                return PollStep::Continue(self.settings.retry_delay);
            }
        };

        if let Err(err) = self.reconciler.apply_status(job_id, &report).await {
            warn!(target: "generation.poll", %job_id, ?err, "failed to apply polled status");
            return PollStep::Continue(self.settings.retry_delay);
        }
        if report.status.is_terminal() {
            PollStep::Done
        } else {
            PollStep::Continue(self.settings.interval)
        }
    }

    /// Poll until a terminal status or until attempts run out, in which case
    /// the job is failed and refunded.
    pub async fn run(&self, job_id: Uuid, external_job_id: String) {
        let mut delay = self.settings.interval;
        for attempt in 1..=self.settings.max_attempts.max(1) {
            sleep(delay).await;
            match self.tick(job_id, &external_job_id).await {
                PollStep::Done => return,
                PollStep::Continue(next) => {
                    debug!(target: "generation.poll", %job_id, attempt, "job still running");
                    delay = next;
                }
            }
        }

        let reason = format!(
            "no terminal status after {} status polls",
            self.settings.max_attempts
        );
        info!(target: "generation.poll", %job_id, %reason, "polling exhausted");
        if let Err(err) = self.reconciler.force_fail(job_id, &reason).await {
            warn!(target: "generation.poll", %job_id, ?err, "failed to fail exhausted job; sweeper will retry");
        }
    }

    pub fn schedule(&self, job_id: Uuid, external_job_id: String) {
        let poller = self.clone();
        tokio::spawn(async move {
            poller.run(job_id, external_job_id).await;
        });
    }

    /// Restart polling for every processing job the provider already holds.
    /// Used on startup when no callback URL is registered, since poll loops
    /// do not survive a restart.
    pub async fn resume_in_flight(&self) -> usize {
        let jobs = match self.store.in_flight_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(target: "generation.poll", ?err, "failed to load in-flight jobs");
                return 0;
            }
        };
        let mut resumed = 0;
        for job in jobs {
            if let Some(external_job_id) = job.external_job_id {
                self.schedule(job.id, external_job_id);
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(target: "generation.poll", count = resumed, "resumed polling for in-flight jobs");
        }
        resumed
    }
}

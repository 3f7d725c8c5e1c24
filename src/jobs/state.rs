use super::models::{GenerationJob, JobState};
use crate::provider::{ProviderPrediction, ProviderStatus};

pub const NO_OUTPUT_ERROR: &str = "provider reported success without an output";

/// What a provider report means for a job, before any side effects run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Job already terminal, or the report adds nothing.
    NoOp,
    MarkProcessing,
    Complete { output_url: String },
    /// Failed or Canceled; always compensated with a refund.
    Fail { state: JobState, reason: String },
}

/// key: reconciler-table -> provider status x job state
pub fn plan_transition(job: &GenerationJob, report: &ProviderPrediction) -> Transition {
    if job.state.is_terminal() {
        return Transition::NoOp;
    }

    match report.status {
        ProviderStatus::Starting | ProviderStatus::Processing => {
            if job.state == JobState::Processing && job.processing_started_at.is_some() {
                Transition::NoOp
            } else {
                Transition::MarkProcessing
            }
        }
        ProviderStatus::Succeeded => match report.output_url() {
            Some(output_url) => Transition::Complete { output_url },
            None => Transition::Fail {
                state: JobState::Failed,
                reason: NO_OUTPUT_ERROR.to_string(),
            },
        },
        ProviderStatus::Failed => Transition::Fail {
            state: JobState::Failed,
            reason: report
                .error_message()
                .unwrap_or_else(|| "generation failed at provider".to_string()),
        },
        ProviderStatus::Canceled => Transition::Fail {
            state: JobState::Canceled,
            reason: report
                .error_message()
                .unwrap_or_else(|| "generation canceled at provider".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{NewGenerationJob, Resolution};
    use chrono::Utc;
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn job(state: JobState) -> GenerationJob {
        let mut job = NewGenerationJob {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            prompt: "waves".to_string(),
            model_ref: "acme/motion-v2".to_string(),
            duration_seconds: 5,
            resolution: Resolution::Hd720,
            credits_reserved: 42,
            request_params: json!({}),
        }
        .into_job(Utc::now());
        job.state = state;
        if state == JobState::Processing {
            job.processing_started_at = Some(Utc::now());
        }
        job
    }

    fn report(status: ProviderStatus, output: Option<Value>, error: Option<Value>) -> ProviderPrediction {
        ProviderPrediction {
            id: "pred-1".to_string(),
            status,
            output,
            error,
        }
    }

    #[test]
    fn progress_moves_pending_to_processing_once() {
        let started = report(ProviderStatus::Starting, None, None);
        assert_eq!(
            plan_transition(&job(JobState::Pending), &started),
            Transition::MarkProcessing
        );
        assert_eq!(
            plan_transition(&job(JobState::Processing), &started),
            Transition::NoOp
        );
    }

    #[test]
    fn success_with_output_completes() {
        let done = report(
            ProviderStatus::Succeeded,
            Some(json!("https://cdn.example/out.mp4")),
            None,
        );
        assert_eq!(
            plan_transition(&job(JobState::Processing), &done),
            Transition::Complete {
                output_url: "https://cdn.example/out.mp4".to_string()
            }
        );
    }

    #[test]
    fn success_without_output_fails() {
        let done = report(ProviderStatus::Succeeded, Some(json!([])), None);
        assert_eq!(
            plan_transition(&job(JobState::Processing), &done),
            Transition::Fail {
                state: JobState::Failed,
                reason: NO_OUTPUT_ERROR.to_string()
            }
        );
    }

    #[test]
    fn failure_and_cancel_carry_reason() {
        let failed = report(ProviderStatus::Failed, None, Some(json!("CUDA out of memory")));
        assert_eq!(
            plan_transition(&job(JobState::Pending), &failed),
            Transition::Fail {
                state: JobState::Failed,
                reason: "CUDA out of memory".to_string()
            }
        );
        let canceled = report(ProviderStatus::Canceled, None, None);
        assert!(matches!(
            plan_transition(&job(JobState::Processing), &canceled),
            Transition::Fail { state: JobState::Canceled, .. }
        ));
    }

    #[test]
    fn terminal_jobs_ignore_every_status() {
        for state in [JobState::Completed, JobState::Failed, JobState::Canceled] {
            for status in [
                ProviderStatus::Starting,
                ProviderStatus::Processing,
                ProviderStatus::Succeeded,
                ProviderStatus::Failed,
                ProviderStatus::Canceled,
            ] {
                let report = report(status, Some(json!("https://cdn.example/x.mp4")), None);
                assert_eq!(plan_transition(&job(state), &report), Transition::NoOp);
            }
        }
    }
}

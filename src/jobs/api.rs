use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{GenerationJob, JobState, Resolution};
use crate::config;
use crate::dispatch::{DispatchOrchestrator, GenerationRequest, Submission};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::storage::ObjectStorage;
use crate::store::Store;

/// Job as shown to its owner.
#[derive(Debug, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub state: JobState,
    pub prompt: String,
    pub model_ref: String,
    pub duration_seconds: i32,
    pub resolution: Resolution,
    pub credits_reserved: i64,
    pub error_message: Option<String>,
    pub output_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    fn from_job(job: GenerationJob, output_url: Option<String>) -> Self {
        Self {
            id: job.id,
            state: job.state,
            prompt: job.prompt,
            model_ref: job.model_ref,
            duration_seconds: job.duration_seconds,
            resolution: job.resolution,
            credits_reserved: job.credits_reserved,
            error_message: job.error_message,
            output_url,
            created_at: job.created_at,
            processing_started_at: job.processing_started_at,
            completed_at: job.completed_at,
            updated_at: job.updated_at,
        }
    }
}

/// key: generations-api -> submit
pub async fn submit_generation(
    user: AuthUser,
    Extension(orchestrator): Extension<DispatchOrchestrator>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<Submission>)> {
    let Json(request) = payload.map_err(|rejection| AppError::Validation(rejection.body_text()))?;
    let submission = orchestrator.submit(&user.caller(), request).await?;
    tracing::info!(
        job_id = %submission.job_id,
        owner_id = %user.owner_id,
        credits = submission.credits_reserved,
        "generation submitted"
    );
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

/// key: generations-api -> owner-scoped snapshot
pub async fn get_generation(
    user: AuthUser,
    Path(job_id): Path<Uuid>,
    Extension(store): Extension<Arc<dyn Store>>,
    Extension(storage): Extension<Arc<dyn ObjectStorage>>,
) -> AppResult<Json<JobSnapshot>> {
    let job = store
        .job(job_id)
        .await?
        .filter(|job| job.owner_id == user.owner_id || user.is_admin())
        .ok_or_else(|| AppError::NotFound("generation".to_string()))?;

    let output_url = match (job.state, job.output_ref.as_deref()) {
        (JobState::Completed, Some(key)) => Some(
            storage
                .url(key, Duration::seconds(*config::OUTPUT_URL_TTL_SECS))
                .await
                .map_err(|err| AppError::ExternalService(format!("{err:#}")))?,
        ),
        _ => None,
    };
    Ok(Json(JobSnapshot::from_job(job, output_url)))
}

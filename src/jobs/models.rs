use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// key: generation-job-state -> forward-only lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Canceled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Processing => 1,
            JobState::Completed | JobState::Failed | JobState::Canceled => 2,
        }
    }

    /// Pending -> Processing -> terminal. Processing may be re-asserted, nothing
    /// leaves a terminal state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            return next == JobState::Processing;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "canceled" => Ok(JobState::Canceled),
            other => Err(format!("unknown job state `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "480p")]
    Sd480,
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    FullHd1080,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Resolution::Sd480, Resolution::Hd720, Resolution::FullHd1080];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Sd480 => "480p",
            Resolution::Hd720 => "720p",
            Resolution::FullHd1080 => "1080p",
        }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Hd720
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "480p" => Ok(Resolution::Sd480),
            "720p" => Ok(Resolution::Hd720),
            "1080p" => Ok(Resolution::FullHd1080),
            other => Err(format!("unsupported resolution `{other}`")),
        }
    }
}

/// key: entitlement-tier -> resolution and model gates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementTier {
    Free,
    Pro,
    Enterprise,
}

impl EntitlementTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementTier::Free => "free",
            EntitlementTier::Pro => "pro",
            EntitlementTier::Enterprise => "enterprise",
        }
    }

    pub fn max_resolution(&self) -> Resolution {
        match self {
            EntitlementTier::Free => Resolution::Hd720,
            EntitlementTier::Pro | EntitlementTier::Enterprise => Resolution::FullHd1080,
        }
    }

    pub fn allows(&self, resolution: Resolution) -> bool {
        resolution <= self.max_resolution()
    }
}

impl Default for EntitlementTier {
    fn default() -> Self {
        EntitlementTier::Free
    }
}

impl FromStr for EntitlementTier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(EntitlementTier::Free),
            "pro" => Ok(EntitlementTier::Pro),
            "enterprise" => Ok(EntitlementTier::Enterprise),
            other => Err(format!("unknown entitlement tier `{other}`")),
        }
    }
}

/// key: generation-job-model -> persisted job row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub prompt: String,
    pub model_ref: String,
    pub duration_seconds: i32,
    pub resolution: Resolution,
    pub state: JobState,
    pub credits_reserved: i64,
    pub external_job_id: Option<String>,
    pub output_ref: Option<String>,
    pub error_message: Option<String>,
    pub request_params: Value,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

/// Everything needed to insert a Pending job together with its debit.
#[derive(Debug, Clone)]
pub struct NewGenerationJob {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub prompt: String,
    pub model_ref: String,
    pub duration_seconds: i32,
    pub resolution: Resolution,
    pub credits_reserved: i64,
    pub request_params: Value,
}

impl NewGenerationJob {
    pub fn into_job(self, now: DateTime<Utc>) -> GenerationJob {
        GenerationJob {
            id: self.id,
            owner_id: self.owner_id,
            prompt: self.prompt,
            model_ref: self.model_ref,
            duration_seconds: self.duration_seconds,
            resolution: self.resolution,
            state: JobState::Pending,
            credits_reserved: self.credits_reserved,
            external_job_id: None,
            output_ref: None,
            error_message: None,
            request_params: self.request_params,
            created_at: now,
            processing_started_at: None,
            completed_at: None,
            updated_at: now,
            version: 0,
        }
    }
}

/// A versioned write against one job row. Fields left as `None` keep their
/// stored value.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub state: JobState,
    pub external_job_id: Option<String>,
    pub output_ref: Option<String>,
    pub error_message: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Refund `credits_reserved` in the same commit.
    pub refund: bool,
}

impl JobUpdate {
    pub fn to_state(state: JobState) -> Self {
        Self {
            state,
            external_job_id: None,
            output_ref: None,
            error_message: None,
            processing_started_at: None,
            completed_at: None,
            refund: false,
        }
    }

    /// Apply the update to an in-memory copy of the row.
    pub fn apply_to(&self, job: &mut GenerationJob, now: DateTime<Utc>) {
        job.state = self.state;
        if let Some(external_job_id) = &self.external_job_id {
            job.external_job_id = Some(external_job_id.clone());
        }
        if let Some(output_ref) = &self.output_ref {
            job.output_ref = Some(output_ref.clone());
        }
        if let Some(error_message) = &self.error_message {
            job.error_message = Some(error_message.clone());
        }
        if job.processing_started_at.is_none() {
            job.processing_started_at = self.processing_started_at;
        }
        if let Some(completed_at) = self.completed_at {
            job.completed_at = Some(completed_at);
        }
        job.updated_at = now;
        job.version += 1;
    }
}

use std::sync::Arc;

use dashmap::DashSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config;
use crate::jobs::{EntitlementTier, GenerationJob, JobState, NewGenerationJob, Resolution};
use crate::job_queue::DispatchQueue;
use crate::ledger::{CreditLedger, LedgerError};
use crate::polling::Poller;
use crate::pricing::{PricingEngine, PricingError, MAX_DURATION_SECONDS, MIN_DURATION_SECONDS};
use crate::provider::{PredictionRequest, VideoProvider};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
use crate::store::{Store, StoreError};

pub const MAX_PROMPT_CHARS: usize = 2000;
const MAX_OPTION_KEYS: usize = 20;
const SUBMIT_OPERATION: &str = "generation.submit";

static MODEL_REF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9._-]*/[a-z0-9][a-z0-9._-]*(:[a-z0-9][a-z0-9._-]*)?$")
        .expect("invalid regex")
});

/// Who is submitting, as resolved by the identity layer.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub owner_id: Uuid,
    pub tier: EntitlementTier,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model_ref: String,
    pub duration_seconds: i64,
    #[serde(default)]
    pub resolution: Option<String>,
    /// Extra provider inputs (seed, aspect ratio, ...).
    #[serde(default)]
    pub options: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub prompt: String,
    pub model_ref: String,
    pub duration_seconds: i32,
    pub resolution: Resolution,
    pub options: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Validation(String),
    #[error("too many submissions; retry in {}s", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },
    #[error("model `{0}` not found")]
    ModelNotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },
    #[error("pricing unavailable: {0}")]
    Configuration(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<PricingError> for SubmitError {
    fn from(err: PricingError) -> Self {
        match err {
            PricingError::ModelNotFound(model_ref) => SubmitError::ModelNotFound(model_ref),
            PricingError::Configuration(reason) => SubmitError::Configuration(reason),
            PricingError::Validation(reason) => SubmitError::Validation(reason),
            PricingError::Store(err) => SubmitError::Store(err),
        }
    }
}

impl From<LedgerError> for SubmitError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits { balance, required } => {
                SubmitError::InsufficientCredits { balance, required }
            }
            LedgerError::InvalidAmount(reason) => SubmitError::Validation(reason),
            LedgerError::Store(err) => SubmitError::Store(err),
        }
    }
}

/// Trim, drop control characters other than newline and tab, and bound the length.
pub fn sanitize_prompt(raw: &str) -> Result<String, SubmitError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let cleaned = cleaned.trim().to_string();
    let length = cleaned.chars().count();
    if length == 0 {
        return Err(SubmitError::Validation("prompt must not be empty".to_string()));
    }
    if length > MAX_PROMPT_CHARS {
        return Err(SubmitError::Validation(format!(
            "prompt must be at most {MAX_PROMPT_CHARS} characters"
        )));
    }
    Ok(cleaned)
}

/// key: submission-validation -> shape checks before anything is charged
pub fn validate_request(request: &GenerationRequest) -> Result<ValidatedRequest, SubmitError> {
    let prompt = sanitize_prompt(&request.prompt)?;

    let model_ref = request.model_ref.trim().to_string();
    if !MODEL_REF_RE.is_match(&model_ref) {
        return Err(SubmitError::Validation(format!(
            "model reference `{model_ref}` must look like owner/name[:version]"
        )));
    }

    let duration = request.duration_seconds;
    if !(i64::from(MIN_DURATION_SECONDS)..=i64::from(MAX_DURATION_SECONDS)).contains(&duration) {
        return Err(SubmitError::Validation(format!(
            "duration must be between {MIN_DURATION_SECONDS} and {MAX_DURATION_SECONDS} seconds"
        )));
    }

    let resolution = match request.resolution.as_deref().map(str::trim) {
        None | Some("") => Resolution::default(),
        Some(raw) => raw.parse::<Resolution>().map_err(SubmitError::Validation)?,
    };

    let options = request.options.clone().unwrap_or_default();
    if options.len() > MAX_OPTION_KEYS {
        return Err(SubmitError::Validation(format!(
            "at most {MAX_OPTION_KEYS} provider options are allowed"
        )));
    }

    Ok(ValidatedRequest {
        prompt,
        model_ref,
        duration_seconds: duration as i32,
        resolution,
        options,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub job_id: Uuid,
    pub credits_reserved: i64,
    pub balance: i64,
}

/// key: dispatch-orchestrator -> validate, limit, price, reserve, enqueue
#[derive(Clone)]
pub struct DispatchOrchestrator {
    pricing: PricingEngine,
    ledger: CreditLedger,
    limiter: Arc<dyn RateLimiter>,
    queue: DispatchQueue,
}

impl DispatchOrchestrator {
    pub fn new(
        pricing: PricingEngine,
        ledger: CreditLedger,
        limiter: Arc<dyn RateLimiter>,
        queue: DispatchQueue,
    ) -> Self {
        Self {
            pricing,
            ledger,
            limiter,
            queue,
        }
    }

    /// Every failure here happens before any credit moves, except a closed
    /// queue, which leaves the funded job for the startup replay or sweeper.
    pub async fn submit(
        &self,
        caller: &Caller,
        request: GenerationRequest,
    ) -> Result<Submission, SubmitError> {
        let request = validate_request(&request)?;

        if let RateDecision::Limited { retry_after } = self
            .limiter
            .check(&caller.owner_id.to_string(), SUBMIT_OPERATION)
        {
            return Err(SubmitError::RateLimited { retry_after });
        }

        let model = self.pricing.active_model(&request.model_ref).await?;
        if caller.tier < model.min_tier {
            return Err(SubmitError::Forbidden(format!(
                "model `{}` requires the {} tier",
                model.model_ref,
                model.min_tier.as_str()
            )));
        }
        if !caller.tier.allows(request.resolution) {
            return Err(SubmitError::Forbidden(format!(
                "{} output requires a higher tier than {}",
                request.resolution,
                caller.tier.as_str()
            )));
        }
        if request.duration_seconds > model.max_duration_seconds {
            return Err(SubmitError::Validation(format!(
                "model `{}` supports at most {} seconds",
                model.model_ref, model.max_duration_seconds
            )));
        }

        let quote = self
            .pricing
            .quote_model(&model, request.duration_seconds, request.resolution)
            .await?;

        let new_job = NewGenerationJob {
            id: Uuid::new_v4(),
            owner_id: caller.owner_id,
            request_params: json!({
                "prompt": request.prompt,
                "duration_seconds": request.duration_seconds,
                "resolution": request.resolution,
                "options": request.options,
                "cost_per_second": quote.cost_per_second,
                "total_usd": quote.total_usd,
            }),
            prompt: request.prompt,
            model_ref: model.model_ref,
            duration_seconds: request.duration_seconds,
            resolution: request.resolution,
            credits_reserved: quote.credits,
        };
        let (job, debit) = self.ledger.reserve_for_job(new_job).await?;

        if let Err(err) = self.queue.enqueue(job.id).await {
            error!(target: "generation.dispatch", job_id = %job.id, ?err, "dispatch queue unavailable; job left pending");
        }

        Ok(Submission {
            job_id: job.id,
            credits_reserved: job.credits_reserved,
            balance: debit.balance_after,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchSettings {
    /// Webhook callback handed to the provider; `None` means poll.
    pub callback_url: Option<String>,
}

impl DispatchSettings {
    pub fn from_env() -> Self {
        let callback_url = if config::WEBHOOK_SIGNING_SECRET.is_some() {
            config::PUBLIC_BASE_URL
                .as_deref()
                .and_then(public_callback_url)
        } else {
            None
        };
        Self { callback_url }
    }
}

/// Webhook URL for `base`, or `None` when the host cannot be reached from
/// the internet (loopback, private ranges, `localhost`, `.local`).
pub fn public_callback_url(base: &str) -> Option<String> {
    let mut parsed = url::Url::parse(base).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let public = match parsed.host()? {
        url::Host::Domain(domain) => {
            let domain = domain.to_ascii_lowercase();
            domain != "localhost"
                && !domain.ends_with(".localhost")
                && !domain.ends_with(".local")
                && !domain.ends_with(".internal")
                && domain.contains('.')
        }
        url::Host::Ipv4(ip) => {
            !(ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast())
        }
        url::Host::Ipv6(ip) => !(ip.is_loopback() || ip.is_unspecified()),
    };
    if !public {
        return None;
    }
    // keep any path prefix the service is mounted under
    if !parsed.path().ends_with('/') {
        let path = format!("{}/", parsed.path());
        parsed.set_path(&path);
    }
    parsed
        .join("api/webhooks/provider")
        .ok()
        .map(|url| url.to_string())
}

fn provider_input(job: &GenerationJob) -> Value {
    let mut input = job
        .request_params
        .get("options")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    input.insert("prompt".to_string(), json!(job.prompt));
    input.insert("duration".to_string(), json!(job.duration_seconds));
    input.insert("resolution".to_string(), json!(job.resolution.as_str()));
    Value::Object(input)
}

/// key: dispatcher -> hand a funded job to the provider
pub struct Dispatcher {
    store: Arc<dyn Store>,
    provider: Arc<dyn VideoProvider>,
    reconciler: Reconciler,
    poller: Poller,
    settings: DispatchSettings,
    in_flight: DashSet<Uuid>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn VideoProvider>,
        reconciler: Reconciler,
        poller: Poller,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            provider,
            reconciler,
            poller,
            settings,
            in_flight: DashSet::new(),
        }
    }

    pub async fn dispatch(&self, job_id: Uuid) {
        if !self.in_flight.insert(job_id) {
            debug!(target: "generation.dispatch", %job_id, "dispatch already in flight");
            return;
        }
        if let Err(err) = self.dispatch_job(job_id).await {
            error!(target: "generation.dispatch", %job_id, ?err, "dispatch failed");
        }
        self.in_flight.remove(&job_id);
    }

    async fn dispatch_job(&self, job_id: Uuid) -> Result<(), ReconcileError> {
        let Some(job) = self.store.job(job_id).await? else {
            warn!(target: "generation.dispatch", %job_id, "dispatched job does not exist");
            return Ok(());
        };
        if job.state != JobState::Pending || job.external_job_id.is_some() {
            debug!(target: "generation.dispatch", %job_id, state = %job.state, "job already dispatched");
            return Ok(());
        }

        let version = self
            .store
            .model(&job.model_ref)
            .await?
            .and_then(|model| model.provider_version);
        let request = PredictionRequest {
            model_ref: job.model_ref.clone(),
            version,
            input: provider_input(&job),
            webhook: self.settings.callback_url.clone(),
        };

        let prediction = match self.provider.create_prediction(&request).await {
            Ok(prediction) => prediction,
            Err(err) => {
                warn!(target: "generation.dispatch", %job_id, error = %err, "provider rejected generation");
                self.reconciler
                    .force_fail(job_id, &format!("provider request failed: {err}"))
                    .await?;
                return Ok(());
            }
        };

        let outcome = self.reconciler.mark_dispatched(job_id, &prediction.id).await?;
        if !matches!(outcome, ReconcileOutcome::Applied { .. }) {
            return Ok(());
        }
        info!(
            target: "generation.dispatch",
            %job_id,
            external_job_id = %prediction.id,
            provider = self.provider.name(),
            callback = self.settings.callback_url.is_some(),
            "generation dispatched"
        );

        if prediction.status.is_terminal() {
            self.reconciler.apply_status(job_id, &prediction).await?;
        } else if self.settings.callback_url.is_none() {
            self.poller.schedule(job_id, prediction.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str, model_ref: &str, duration: i64, resolution: Option<&str>) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            model_ref: model_ref.to_string(),
            duration_seconds: duration,
            resolution: resolution.map(str::to_string),
            options: None,
        }
    }

    #[test]
    fn prompt_is_sanitized() {
        assert_eq!(
            sanitize_prompt("  a cat\u{0007} on\tthe\nmoon  ").unwrap(),
            "a cat on\tthe\nmoon"
        );
        assert!(sanitize_prompt(" \u{0000} ").is_err());
        assert!(sanitize_prompt(&"x".repeat(MAX_PROMPT_CHARS + 1)).is_err());
        assert!(sanitize_prompt(&"é".repeat(MAX_PROMPT_CHARS)).is_ok());
    }

    #[test]
    fn model_refs_follow_owner_name_version() {
        for ok in ["acme/motion-v2", "acme/motion_v2.1:abc123", "a/b"] {
            assert!(validate_request(&request("p", ok, 5, None)).is_ok(), "{ok}");
        }
        for bad in ["motion", "Acme/Motion", "acme/motion:", "../etc", "acme/motion v2"] {
            assert!(validate_request(&request("p", bad, 5, None)).is_err(), "{bad}");
        }
    }

    #[test]
    fn duration_and_resolution_are_checked() {
        assert!(validate_request(&request("p", "acme/m", 0, None)).is_err());
        assert!(validate_request(&request("p", "acme/m", 301, None)).is_err());
        assert!(validate_request(&request("p", "acme/m", 5, Some("4k"))).is_err());
        let ok = validate_request(&request("p", "acme/m", 300, Some("1080p"))).unwrap();
        assert_eq!(ok.resolution, Resolution::FullHd1080);
        let default = validate_request(&request("p", "acme/m", 5, None)).unwrap();
        assert_eq!(default.resolution, Resolution::Hd720);
    }

    #[test]
    fn callbacks_only_for_public_hosts() {
        assert_eq!(
            public_callback_url("https://reels.example.com").as_deref(),
            Some("https://reels.example.com/api/webhooks/provider")
        );
        assert_eq!(
            public_callback_url("https://reels.example.com/").as_deref(),
            Some("https://reels.example.com/api/webhooks/provider")
        );
        for private in [
            "http://localhost:3000",
            "http://127.0.0.1:3000",
            "http://10.0.0.4",
            "http://192.168.1.20:8080",
            "http://reels.local",
            "http://[::1]:3000",
            "ftp://reels.example.com",
            "not a url",
        ] {
            assert_eq!(public_callback_url(private), None, "{private}");
        }
    }

    #[test]
    fn callback_keeps_base_path_prefix() {
        assert_eq!(
            public_callback_url("https://host.example/app").as_deref(),
            Some("https://host.example/app/api/webhooks/provider")
        );
        assert_eq!(
            public_callback_url("https://host.example/app/").as_deref(),
            Some("https://host.example/app/api/webhooks/provider")
        );
    }
}

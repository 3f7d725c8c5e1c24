use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use super::models::{EventKey, ProcessedEvent};
use super::signature::{verify, SignatureError, WebhookHeaders};
use crate::provider::ProviderPrediction;
use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("signature rejected: {0}")]
    Signature(#[from] SignatureError),
    #[error("malformed webhook body: {0}")]
    Malformed(String),
    #[error("no generation job for external id {0}")]
    UnknownJob(String),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::Signature(_) => StatusCode::UNAUTHORIZED,
            IngestError::Malformed(_) => StatusCode::BAD_REQUEST,
            IngestError::UnknownJob(_) => StatusCode::NOT_FOUND,
            IngestError::Reconcile(_) | IngestError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    /// Job was already terminal or already reflected the report.
    NoOp,
    /// This event was applied successfully before.
    Duplicate,
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Applied => "applied",
            IngestOutcome::NoOp => "noop",
            IngestOutcome::Duplicate => "duplicate",
        }
    }
}

/// key: webhook-ingestion -> verify, dedupe, reconcile, record
pub struct WebhookIngestor {
    store: Arc<dyn Store>,
    reconciler: Reconciler,
    secret: String,
    source: String,
}

impl WebhookIngestor {
    pub fn new(
        store: Arc<dyn Store>,
        reconciler: Reconciler,
        secret: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            store,
            reconciler,
            secret: secret.into(),
            source: source.into(),
        }
    }

    /// Verify and apply one raw delivery.
    pub async fn ingest(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        verify(&self.secret, headers, body, Utc::now().timestamp())?;
        let prediction: ProviderPrediction = serde_json::from_slice(body)
            .map_err(|err| IngestError::Malformed(err.to_string()))?;
        if prediction.id.trim().is_empty() {
            return Err(IngestError::Malformed("missing prediction id".to_string()));
        }
        let metadata = json!({
            "webhook_id": headers.id,
            "status": prediction.status,
        });
        self.handle(&prediction, metadata).await
    }

    /// Apply an already-verified provider event. Only an event that was
    /// applied successfully before is skipped; an earlier failed attempt is
    /// retried and its record updated.
    pub async fn handle(
        &self,
        prediction: &ProviderPrediction,
        metadata: serde_json::Value,
    ) -> Result<IngestOutcome, IngestError> {
        let key = EventKey::new(
            format!("{}:{}:{}", self.source, prediction.id, prediction.status),
            self.source.as_str(),
        );
        let previous = self.store.processed_event(&key).await?;
        if previous
            .as_ref()
            .map_or(false, ProcessedEvent::suppresses_redelivery)
        {
            info!(
                target: "generation.webhook",
                event = %key.external_event_id,
                "duplicate delivery ignored"
            );
            return Ok(IngestOutcome::Duplicate);
        }

        let job = self
            .store
            .job_by_external_id(&prediction.id)
            .await?
            .ok_or_else(|| IngestError::UnknownJob(prediction.id.clone()))?;

        let result = self.reconciler.apply_status(job.id, prediction).await;
        let record = ProcessedEvent {
            key,
            processed: result.is_ok(),
            processed_at: Utc::now(),
            error_message: result.as_ref().err().map(ToString::to_string),
            metadata,
            attempts: previous.map_or(1, |event| event.attempts + 1),
        };
        if let Err(err) = self.store.record_processed_event(&record).await {
            error!(
                target: "generation.webhook",
                event = %record.key.external_event_id,
                ?err,
                "failed to record processed event"
            );
        }

        match result? {
            ReconcileOutcome::Applied { .. } => Ok(IngestOutcome::Applied),
            ReconcileOutcome::NoOp => Ok(IngestOutcome::NoOp),
        }
    }
}

pub async fn provider_webhook(
    Extension(ingestor): Extension<Arc<WebhookIngestor>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let webhook_headers = WebhookHeaders::from_headers(&headers);
    match ingestor.ingest(&webhook_headers, &body).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "status": outcome.as_str() })),
        )
            .into_response(),
        Err(err) => {
            let status = err.status_code();
            if status.is_server_error() {
                error!(target: "generation.webhook", ?err, "webhook processing failed");
            } else {
                warn!(target: "generation.webhook", %status, error = %err, "webhook rejected");
            }
            let message = match &err {
                IngestError::Reconcile(_) | IngestError::Store(_) => "internal error".to_string(),
                other => other.to_string(),
            };
            (status, Json(json!({ "error": message }))).into_response()
        }
    }
}

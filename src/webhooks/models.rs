use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// key: idempotency-store -> (external event id, source)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EventKey {
    pub external_event_id: String,
    pub source: String,
}

impl EventKey {
    pub fn new(external_event_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            external_event_id: external_event_id.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessedEvent {
    pub key: EventKey,
    /// `true` once the event was applied without error.
    pub processed: bool,
    pub processed_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub metadata: Value,
    pub attempts: i32,
}

impl ProcessedEvent {
    /// Only a successfully applied event suppresses redelivery.
    pub fn suppresses_redelivery(&self) -> bool {
        self.processed
    }
}

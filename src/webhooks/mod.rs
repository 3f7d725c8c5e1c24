pub mod ingest;
pub mod models;
pub mod signature;

pub use ingest::{provider_webhook, IngestError, IngestOutcome, WebhookIngestor};
pub use models::{EventKey, ProcessedEvent};
pub use signature::{sign, verify, SignatureError, WebhookHeaders, REPLAY_WINDOW_SECS};

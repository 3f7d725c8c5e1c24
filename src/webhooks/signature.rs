use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed skew between a signed event's timestamp and now.
pub const REPLAY_WINDOW_SECS: i64 = 300;

const SECRET_PREFIX: &str = "whsec_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("malformed webhook-timestamp")]
    BadTimestamp,
    #[error("timestamp outside the replay window")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
    #[error("unusable signing secret")]
    InvalidSecret,
}

/// The three signing headers as sent by the provider. Any of them may be
/// absent; `verify` rejects that.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    pub id: Option<String>,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
}

impl WebhookHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            id: read("webhook-id"),
            timestamp: read("webhook-timestamp"),
            signature: read("webhook-signature"),
        }
    }
}

fn secret_bytes(secret: &str) -> Vec<u8> {
    match secret.strip_prefix(SECRET_PREFIX) {
        Some(encoded) => STANDARD
            .decode(encoded)
            .unwrap_or_else(|_| secret.as_bytes().to_vec()),
        None => secret.as_bytes().to_vec(),
    }
}

fn signer(
    secret: &str,
    id: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(&secret_bytes(secret))
        .map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// `v1,<base64>` over `id.timestamp.body`.
pub fn sign(
    secret: &str,
    id: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<String, SignatureError> {
    let digest = signer(secret, id, timestamp, body)?.finalize().into_bytes();
    Ok(format!("v1,{}", STANDARD.encode(digest)))
}

/// key: webhook-signature -> hmac-sha256 with replay window
pub fn verify(
    secret: &str,
    headers: &WebhookHeaders,
    body: &[u8],
    now_unix: i64,
) -> Result<(), SignatureError> {
    if secret.trim().is_empty() {
        return Err(SignatureError::InvalidSecret);
    }
    let id = headers
        .id
        .as_deref()
        .ok_or(SignatureError::MissingHeader("webhook-id"))?;
    let timestamp = headers
        .timestamp
        .as_deref()
        .ok_or(SignatureError::MissingHeader("webhook-timestamp"))?;
    let signature = headers
        .signature
        .as_deref()
        .ok_or(SignatureError::MissingHeader("webhook-signature"))?;

    let sent_at: i64 = timestamp
        .parse()
        .map_err(|_| SignatureError::BadTimestamp)?;
    if (now_unix - sent_at).abs() > REPLAY_WINDOW_SECS {
        return Err(SignatureError::Expired);
    }

    let mac = signer(secret, id, timestamp, body)?;
    let matched = signature
        .split_whitespace()
        .filter_map(|entry| entry.strip_prefix("v1,"))
        .filter_map(|encoded| STANDARD.decode(encoded).ok())
        .any(|candidate| mac.clone().verify_slice(&candidate).is_ok());

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

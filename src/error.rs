use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::dispatch::SubmitError;
use crate::ledger::LedgerError;
use crate::pricing::PricingError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },
    #[error("{0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },
    #[error("upstream service error: {0}")]
    ExternalService(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            AppError::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text safe to show the caller; internals stay in the logs.
    fn public_message(&self) -> String {
        match self {
            AppError::ExternalService(_) => "upstream service unavailable".to_string(),
            AppError::Configuration(_) => "temporarily unavailable".to_string(),
            AppError::Store(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self);
        }
        let mut response = (status, Json(json!({ "error": self.public_message() }))).into_response();
        if let AppError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Validation(reason) => AppError::Validation(reason),
            SubmitError::RateLimited { retry_after } => AppError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            },
            SubmitError::ModelNotFound(model_ref) => AppError::NotFound(format!("model `{model_ref}`")),
            SubmitError::Forbidden(reason) => AppError::Forbidden(reason),
            SubmitError::InsufficientCredits { balance, required } => {
                AppError::InsufficientCredits { balance, required }
            }
            SubmitError::Configuration(reason) => AppError::Configuration(reason),
            SubmitError::Store(err) => AppError::Store(err),
        }
    }
}

impl From<PricingError> for AppError {
    fn from(err: PricingError) -> Self {
        SubmitError::from(err).into()
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        SubmitError::from(err).into()
    }
}

pub type AppResult<T> = Result<T, AppError>;

use axum::{
    routing::{get, post},
    Router,
};

use crate::{jobs, ledger, pricing, storage, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/generations", post(jobs::api::submit_generation))
        .route("/api/generations/:id", get(jobs::api::get_generation))
        .route("/api/pricing/quote", get(pricing::get_quote))
        .route("/api/credits", get(ledger::api::get_credits))
        .route(
            "/api/credits/transactions",
            get(ledger::api::list_transactions),
        )
        .route("/api/credits/audit", get(ledger::api::get_audit))
        .route("/api/credits/grants", post(ledger::api::grant_credits))
        .route("/api/webhooks/provider", post(webhooks::provider_webhook))
        .route("/media/*key", get(storage::serve_media))
}

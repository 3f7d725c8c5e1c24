use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CreditAccount, CreditLedger, CreditTransaction, LedgerAudit};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub owner_id: Uuid,
    pub amount: i64,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct GrantResponse {
    pub transaction: CreditTransaction,
    pub balance: i64,
}

/// key: credits-api -> balance, history, grants
pub async fn get_credits(
    user: AuthUser,
    Extension(ledger): Extension<CreditLedger>,
) -> AppResult<Json<CreditAccount>> {
    Ok(Json(ledger.account(user.owner_id).await?))
}

pub async fn list_transactions(
    user: AuthUser,
    Extension(ledger): Extension<CreditLedger>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<CreditTransaction>>> {
    let limit = query.limit.unwrap_or(50);
    Ok(Json(ledger.history(user.owner_id, limit).await?))
}

/// Recompute the caller's balance from the transaction log.
pub async fn get_audit(
    user: AuthUser,
    Extension(ledger): Extension<CreditLedger>,
) -> AppResult<Json<LedgerAudit>> {
    Ok(Json(ledger.audit(user.owner_id).await?))
}

/// Billing collaborators top accounts up here; admin only.
pub async fn grant_credits(
    user: AuthUser,
    Extension(ledger): Extension<CreditLedger>,
    Json(request): Json<GrantRequest>,
) -> AppResult<(StatusCode, Json<GrantResponse>)> {
    if !user.is_admin() {
        return Err(AppError::Forbidden("granting credits requires admin".to_string()));
    }
    let reason = request.reason.trim();
    if reason.is_empty() {
        return Err(AppError::Validation("grant reason is required".to_string()));
    }
    let transaction = ledger.grant(request.owner_id, request.amount, reason).await?;
    Ok((
        StatusCode::CREATED,
        Json(GrantResponse {
            balance: transaction.balance_after,
            transaction,
        }),
    ))
}

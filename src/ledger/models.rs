use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// key: ledger-models -> accounts,transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Debit,
    Refund,
    Grant,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Debit => "debit",
            TransactionKind::Refund => "refund",
            TransactionKind::Grant => "grant",
        }
    }

    /// Signed effect on the cached balance.
    pub fn signed(&self, amount: i64) -> i64 {
        match self {
            TransactionKind::Debit => -amount,
            TransactionKind::Refund | TransactionKind::Grant => amount,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "debit" => Ok(TransactionKind::Debit),
            "refund" => Ok(TransactionKind::Refund),
            "grant" => Ok(TransactionKind::Grant),
            other => Err(format!("unknown transaction kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAccount {
    pub owner_id: Uuid,
    pub balance: i64,
    pub total_debited: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditAccount {
    pub fn empty(owner_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            balance: 0,
            total_debited: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Append-only ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub kind: TransactionKind,
    pub amount: i64,
    pub related_job_id: Option<Uuid>,
    pub reason: Option<String>,
    pub balance_before: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

/// A requested ledger mutation, validated by the store before it is appended.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub owner_id: Uuid,
    pub kind: TransactionKind,
    pub amount: i64,
    pub related_job_id: Option<Uuid>,
    pub reason: Option<String>,
}

impl LedgerEntry {
    pub fn debit(owner_id: Uuid, amount: i64, related_job_id: Uuid) -> Self {
        Self {
            owner_id,
            kind: TransactionKind::Debit,
            amount,
            related_job_id: Some(related_job_id),
            reason: Some("generation reservation".to_string()),
        }
    }

    pub fn refund(owner_id: Uuid, amount: i64, related_job_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            owner_id,
            kind: TransactionKind::Refund,
            amount,
            related_job_id: Some(related_job_id),
            reason: Some(reason.into()),
        }
    }

    pub fn grant(owner_id: Uuid, amount: i64, reason: impl Into<String>) -> Self {
        Self {
            owner_id,
            kind: TransactionKind::Grant,
            amount,
            related_job_id: None,
            reason: Some(reason.into()),
        }
    }

    pub fn into_transaction(
        self,
        balance_before: i64,
        balance_after: i64,
        now: DateTime<Utc>,
    ) -> CreditTransaction {
        CreditTransaction {
            id: Uuid::new_v4(),
            owner_id: self.owner_id,
            kind: self.kind,
            amount: self.amount,
            related_job_id: self.related_job_id,
            reason: self.reason,
            balance_before,
            balance_after,
            created_at: now,
        }
    }
}

/// Result of appending a ledger entry.
#[derive(Debug, Clone)]
pub enum LedgerApplied {
    Recorded(CreditTransaction),
    /// A refund for the same job already exists; nothing was written.
    AlreadyRefunded { balance: i64 },
}

impl LedgerApplied {
    pub fn balance(&self) -> i64 {
        match self {
            LedgerApplied::Recorded(transaction) => transaction.balance_after,
            LedgerApplied::AlreadyRefunded { balance } => *balance,
        }
    }

    pub fn is_recorded(&self) -> bool {
        matches!(self, LedgerApplied::Recorded(_))
    }
}

/// Balance recomputed from the transaction log next to the cached value.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerAudit {
    pub owner_id: Uuid,
    pub cached_balance: i64,
    pub granted: i64,
    pub refunded: i64,
    pub debited: i64,
}

impl LedgerAudit {
    pub fn reconstructed_balance(&self) -> i64 {
        self.granted + self.refunded - self.debited
    }

    pub fn is_consistent(&self) -> bool {
        self.reconstructed_balance() == self.cached_balance
    }
}

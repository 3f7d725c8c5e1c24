pub mod api;
pub mod models;
pub mod service;

pub use models::{
    CreditAccount, CreditTransaction, LedgerApplied, LedgerAudit, LedgerEntry, TransactionKind,
};
pub use service::{CreditLedger, LedgerError};

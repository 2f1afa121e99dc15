use crate::domain::account::AccountId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("account {0} is blocked: {1}")]
    Blocked(AccountId, String),
    #[error("insufficient funds in account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: i64,
        requested: i64,
    },
    #[error("Transaction conflict: {0}")]
    Conflict(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Malformed event on line {line}: {source}")]
    MalformedEvent {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Ledger store unreachable: {0}")]
    Connectivity(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl LedgerError {
    /// Whether the store asked for the whole transaction to be re-run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

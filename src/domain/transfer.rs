use super::account::{AccountId, Amount};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A committed movement of funds between two accounts. Immutable once written.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub source: AccountId,
    pub destination: AccountId,
    pub amount: Amount,
    pub timestamp: DateTime<Utc>,
}

impl Transfer {
    /// Builds a transfer record with a fresh id, stamped now.
    pub fn new(source: AccountId, destination: AccountId, amount: Amount) -> Self {
        Self {
            id: TransferId::new(),
            source,
            destination,
            amount,
            timestamp: Utc::now(),
        }
    }
}

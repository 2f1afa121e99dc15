use super::account::{AccountId, Amount};
use super::transfer::TransferId;
use crate::error::LedgerError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Reason recorded on every block entry.
pub const BLOCK_REASON: &str = "Suspicious activity detected!";

/// Amounts at or above this are at least a `Warning`.
pub const WARNING_AMOUNT: i64 = 500;
/// Amounts at or above this are an `Alert`.
pub const ALERT_AMOUNT: i64 = 1000;

/// Ordered severity assigned to a single transfer by the velocity policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AnomalyLevel {
    Ok,
    Warning,
    Alert,
}

impl AnomalyLevel {
    pub fn from_amount(amount: Amount) -> Self {
        match amount.value() {
            v if v < WARNING_AMOUNT => AnomalyLevel::Ok,
            v if v < ALERT_AMOUNT => AnomalyLevel::Warning,
            _ => AnomalyLevel::Alert,
        }
    }

    /// Escalation weight of one record at this level.
    pub fn weight(self) -> u32 {
        match self {
            AnomalyLevel::Ok => 0,
            AnomalyLevel::Warning => 1,
            AnomalyLevel::Alert => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyLevel::Ok => "Ok",
            AnomalyLevel::Warning => "Warning",
            AnomalyLevel::Alert => "Alert",
        }
    }
}

impl fmt::Display for AnomalyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyLevel {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ok" => Ok(AnomalyLevel::Ok),
            "Warning" => Ok(AnomalyLevel::Warning),
            "Alert" => Ok(AnomalyLevel::Alert),
            other => Err(LedgerError::ValidationError(format!(
                "Unknown anomaly level: {other}"
            ))),
        }
    }
}

/// What a classifier concluded about a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Level(AnomalyLevel),
    Reason(String),
}

impl Classification {
    pub fn weight(&self) -> u32 {
        match self {
            Classification::Level(level) => level.weight(),
            Classification::Reason(_) => 1,
        }
    }
}

/// A classified anomaly. Records are never updated; they age out after their TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: Uuid,
    pub source: AccountId,
    pub destination: AccountId,
    pub transfer_id: Option<TransferId>,
    pub classification: Classification,
    pub expires_at: DateTime<Utc>,
}

impl AnomalyRecord {
    pub fn new(
        source: AccountId,
        destination: AccountId,
        transfer_id: Option<TransferId>,
        classification: Classification,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            destination,
            transfer_id,
            classification,
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Refuses an account as a transfer source until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub source: AccountId,
    pub reason: String,
    pub expires_at: DateTime<Utc>,
}

impl BlockEntry {
    pub fn new(source: AccountId, reason: impl Into<String>, ttl: Duration) -> Self {
        Self {
            source,
            reason: reason.into(),
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

use super::account::AccountId;
use super::transfer::{Transfer, TransferId};
use serde::{Deserialize, Serialize};

/// A change notification describing one committed transfer.
///
/// This is the record shape delivered by the store's change feed, one JSON object per line.
/// `key` carries the row's primary key as the feed reports it and is not interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub id: TransferId,
    #[serde(default)]
    pub key: Vec<String>,
    pub source: AccountId,
    pub destination: AccountId,
}

impl From<&Transfer> for TransferEvent {
    fn from(transfer: &Transfer) -> Self {
        Self {
            id: transfer.id,
            key: vec![transfer.id.to_string()],
            source: transfer.source,
            destination: transfer.destination,
        }
    }
}

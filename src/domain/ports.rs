use super::account::{Account, AccountId, Balance};
use super::anomaly::{AnomalyRecord, BlockEntry};
use super::transfer::{Transfer, TransferId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One serializable transaction against the ledger store.
///
/// Dropping a transaction without calling [`LedgerTx::commit`] rolls it back.
/// `commit` may fail with `LedgerError::Conflict`, in which case the caller re-runs
/// the whole transaction body on a fresh transaction.
#[async_trait]
pub trait LedgerTx: Send {
    /// The active (non-expired) block entry for `source`, if any.
    async fn block_entry(&mut self, source: AccountId) -> Result<Option<BlockEntry>>;
    /// Fails with `NotFound` if the account does not exist.
    async fn balance(&mut self, account: AccountId) -> Result<Balance>;
    /// Adds `delta` to the balance and returns the new value.
    async fn adjust_balance(&mut self, account: AccountId, delta: i64) -> Result<Balance>;
    async fn insert_account(&mut self, account: Account) -> Result<()>;
    async fn insert_transfer(&mut self, transfer: Transfer) -> Result<()>;
    async fn transfer(&mut self, id: TransferId) -> Result<Option<Transfer>>;
    /// Transfers from `source` to `destination` with a timestamp strictly before `before`.
    async fn count_transfers_before(
        &mut self,
        source: AccountId,
        destination: AccountId,
        before: DateTime<Utc>,
    ) -> Result<u64>;
    /// Non-expired anomalies recorded with `source` as the source account.
    async fn anomalies(&mut self, source: AccountId) -> Result<Vec<AnomalyRecord>>;
    async fn has_anomaly_for(&mut self, transfer: TransferId) -> Result<bool>;
    async fn insert_anomaly(&mut self, record: AnomalyRecord) -> Result<()>;
    async fn insert_block(&mut self, entry: BlockEntry) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;
    async fn all_accounts(&self) -> Result<Vec<Account>>;
}

pub type SharedLedger = Arc<dyn LedgerStore>;

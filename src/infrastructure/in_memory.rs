use crate::domain::account::{Account, AccountId, Balance};
use crate::domain::anomaly::{AnomalyRecord, BlockEntry};
use crate::domain::event::TransferEvent;
use crate::domain::ports::{LedgerStore, LedgerTx};
use crate::domain::transfer::{Transfer, TransferId};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::trace;

const FEED_CAPACITY: usize = 1024;

/// Rows (or row ranges) whose version a transaction can depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Account(AccountId),
    Block(AccountId),
    Anomalies(AccountId),
    TransferAnomaly(TransferId),
    Pair(AccountId, AccountId),
    Transfer(TransferId),
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Balance>,
    transfers: HashMap<TransferId, Transfer>,
    anomalies: HashMap<AccountId, Vec<AnomalyRecord>>,
    blocks: HashMap<AccountId, BlockEntry>,
    versions: HashMap<RowKey, u64>,
}

impl LedgerState {
    fn version(&self, key: RowKey) -> u64 {
        self.versions.get(&key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: RowKey) {
        *self.versions.entry(key).or_insert(0) += 1;
    }
}

fn observe(reads: &mut HashMap<RowKey, u64>, state: &LedgerState, key: RowKey) {
    reads.entry(key).or_insert_with(|| state.version(key));
}

/// A thread-safe in-memory ledger with optimistic concurrency control.
///
/// Transactions buffer their writes and remember the version of every row they read.
/// Commit validates those versions under the write lock; if any changed, the commit
/// fails with `LedgerError::Conflict` and nothing is applied. Committed transfers are
/// published on a broadcast channel that stands in for the store's change feed.
#[derive(Clone)]
pub struct InMemoryLedger {
    state: Arc<RwLock<LedgerState>>,
    feed: broadcast::Sender<TransferEvent>,
}

impl InMemoryLedger {
    /// Creates a new, empty in-memory ledger.
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(LedgerState::default())),
            feed,
        }
    }

    /// Subscribes to events for transfers committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.feed.subscribe()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(InMemoryTx {
            state: Arc::clone(&self.state),
            feed: self.feed.clone(),
            reads: HashMap::new(),
            balances: HashMap::new(),
            accounts: Vec::new(),
            transfers: Vec::new(),
            anomalies: Vec::new(),
            blocks: HashMap::new(),
            finished: false,
        }))
    }

    async fn all_accounts(&self) -> Result<Vec<Account>> {
        let state = self.state.read().await;
        let mut accounts: Vec<Account> = state
            .accounts
            .iter()
            .map(|(id, balance)| Account::new(*id, *balance))
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }
}

pub struct InMemoryTx {
    state: Arc<RwLock<LedgerState>>,
    feed: broadcast::Sender<TransferEvent>,
    reads: HashMap<RowKey, u64>,
    balances: HashMap<AccountId, Balance>,
    accounts: Vec<Account>,
    transfers: Vec<Transfer>,
    anomalies: Vec<AnomalyRecord>,
    blocks: HashMap<AccountId, BlockEntry>,
    finished: bool,
}

impl InMemoryTx {
    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            Err(LedgerError::ValidationError(
                "transaction already committed".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    async fn current_balance(&mut self, account: AccountId) -> Result<Balance> {
        if let Some(balance) = self.balances.get(&account) {
            return Ok(*balance);
        }
        if let Some(pending) = self.accounts.iter().find(|a| a.id == account) {
            return Ok(pending.balance);
        }
        let state = self.state.read().await;
        observe(&mut self.reads, &state, RowKey::Account(account));
        state
            .accounts
            .get(&account)
            .copied()
            .ok_or_else(|| LedgerError::NotFound(format!("account {account}")))
    }
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn block_entry(&mut self, source: AccountId) -> Result<Option<BlockEntry>> {
        self.ensure_open()?;
        let now = Utc::now();
        if let Some(entry) = self.blocks.get(&source) {
            return Ok(Some(entry.clone()));
        }
        let state = self.state.read().await;
        observe(&mut self.reads, &state, RowKey::Block(source));
        Ok(state
            .blocks
            .get(&source)
            .filter(|entry| entry.is_active(now))
            .cloned())
    }

    async fn balance(&mut self, account: AccountId) -> Result<Balance> {
        self.ensure_open()?;
        self.current_balance(account).await
    }

    async fn adjust_balance(&mut self, account: AccountId, delta: i64) -> Result<Balance> {
        self.ensure_open()?;
        let updated = self.current_balance(account).await? + Balance::new(delta);
        if updated.is_negative() {
            return Err(LedgerError::ValidationError(format!(
                "balance of account {account} would become negative"
            )));
        }
        if let Some(pending) = self.accounts.iter_mut().find(|a| a.id == account) {
            pending.balance = updated;
        } else {
            self.balances.insert(account, updated);
        }
        Ok(updated)
    }

    async fn insert_account(&mut self, account: Account) -> Result<()> {
        self.ensure_open()?;
        if account.balance.is_negative() {
            return Err(LedgerError::ValidationError(format!(
                "account {} cannot open with a negative balance",
                account.id
            )));
        }
        let state = self.state.read().await;
        observe(&mut self.reads, &state, RowKey::Account(account.id));
        if state.accounts.contains_key(&account.id) {
            return Err(LedgerError::ValidationError(format!(
                "account {} already exists",
                account.id
            )));
        }
        drop(state);
        self.accounts.push(account);
        Ok(())
    }

    async fn insert_transfer(&mut self, transfer: Transfer) -> Result<()> {
        self.ensure_open()?;
        self.transfers.push(transfer);
        Ok(())
    }

    async fn transfer(&mut self, id: TransferId) -> Result<Option<Transfer>> {
        self.ensure_open()?;
        if let Some(pending) = self.transfers.iter().find(|t| t.id == id) {
            return Ok(Some(pending.clone()));
        }
        let state = self.state.read().await;
        observe(&mut self.reads, &state, RowKey::Transfer(id));
        Ok(state.transfers.get(&id).cloned())
    }

    async fn count_transfers_before(
        &mut self,
        source: AccountId,
        destination: AccountId,
        before: DateTime<Utc>,
    ) -> Result<u64> {
        self.ensure_open()?;
        let counted = |t: &Transfer| {
            t.source == source && t.destination == destination && t.timestamp < before
        };
        let pending = self.transfers.iter().filter(|t| counted(*t)).count() as u64;
        let state = self.state.read().await;
        observe(&mut self.reads, &state, RowKey::Pair(source, destination));
        let committed = state.transfers.values().filter(|t| counted(*t)).count() as u64;
        Ok(committed + pending)
    }

    async fn anomalies(&mut self, source: AccountId) -> Result<Vec<AnomalyRecord>> {
        self.ensure_open()?;
        let now = Utc::now();
        let state = self.state.read().await;
        observe(&mut self.reads, &state, RowKey::Anomalies(source));
        let mut records: Vec<AnomalyRecord> = state
            .anomalies
            .get(&source)
            .into_iter()
            .flatten()
            .filter(|record| !record.is_expired(now))
            .cloned()
            .collect();
        drop(state);
        records.extend(
            self.anomalies
                .iter()
                .filter(|record| record.source == source)
                .cloned(),
        );
        Ok(records)
    }

    async fn has_anomaly_for(&mut self, transfer: TransferId) -> Result<bool> {
        self.ensure_open()?;
        if self
            .anomalies
            .iter()
            .any(|record| record.transfer_id == Some(transfer))
        {
            return Ok(true);
        }
        let now = Utc::now();
        let state = self.state.read().await;
        observe(&mut self.reads, &state, RowKey::TransferAnomaly(transfer));
        Ok(state
            .anomalies
            .values()
            .flatten()
            .any(|record| record.transfer_id == Some(transfer) && !record.is_expired(now)))
    }

    async fn insert_anomaly(&mut self, record: AnomalyRecord) -> Result<()> {
        self.ensure_open()?;
        self.anomalies.push(record);
        Ok(())
    }

    async fn insert_block(&mut self, entry: BlockEntry) -> Result<()> {
        self.ensure_open()?;
        self.blocks.insert(entry.source, entry);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;

        for (key, seen) in &self.reads {
            let current = state.version(*key);
            if current != *seen {
                trace!(?key, seen, current, "commit validation failed");
                return Err(LedgerError::Conflict(format!(
                    "{key:?} changed from version {seen} to {current}"
                )));
            }
        }

        for account in self.accounts.drain(..) {
            state.accounts.insert(account.id, account.balance);
            state.bump(RowKey::Account(account.id));
        }
        for (account, balance) in self.balances.drain() {
            state.accounts.insert(account, balance);
            state.bump(RowKey::Account(account));
        }
        let transfers = std::mem::take(&mut self.transfers);
        for transfer in &transfers {
            state.bump(RowKey::Pair(transfer.source, transfer.destination));
            state.bump(RowKey::Transfer(transfer.id));
            state.transfers.insert(transfer.id, transfer.clone());
        }
        for record in self.anomalies.drain(..) {
            state.bump(RowKey::Anomalies(record.source));
            if let Some(transfer) = record.transfer_id {
                state.bump(RowKey::TransferAnomaly(transfer));
            }
            state.anomalies.entry(record.source).or_default().push(record);
        }
        for (source, entry) in self.blocks.drain() {
            state.bump(RowKey::Block(source));
            state.blocks.insert(source, entry);
        }

        let now = Utc::now();
        for records in state.anomalies.values_mut() {
            records.retain(|record| !record.is_expired(now));
        }
        self.finished = true;
        drop(state);

        for transfer in &transfers {
            // No subscribers is fine; the feed is best effort.
            let _ = self.feed.send(TransferEvent::from(transfer));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Amount;
    use crate::domain::anomaly::{AnomalyLevel, BLOCK_REASON, Classification};
    use chrono::Duration;

    async fn seeded(balances: &[i64]) -> (InMemoryLedger, Vec<AccountId>) {
        let store = InMemoryLedger::new();
        let mut tx = store.begin().await.unwrap();
        let mut ids = Vec::new();
        for balance in balances {
            let id = AccountId::new();
            tx.insert_account(Account::new(id, Balance::new(*balance)))
                .await
                .unwrap();
            ids.push(id);
        }
        tx.commit().await.unwrap();
        (store, ids)
    }

    #[tokio::test]
    async fn test_in_memory_accounts_round_trip() {
        let (store, ids) = seeded(&[100, 200]).await;
        let accounts = store.all_accounts().await.unwrap();
        assert_eq!(accounts.len(), 2);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.balance(ids[0]).await.unwrap(), Balance::new(100));
        assert!(matches!(
            tx.balance(AccountId::new()).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_see_own_writes() {
        let (store, ids) = seeded(&[100]).await;
        let mut tx = store.begin().await.unwrap();
        tx.adjust_balance(ids[0], -30).await.unwrap();
        assert_eq!(tx.balance(ids[0]).await.unwrap(), Balance::new(70));
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let (store, ids) = seeded(&[100]).await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.adjust_balance(ids[0], -30).await.unwrap();
        }
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.balance(ids[0]).await.unwrap(), Balance::new(100));
    }

    #[tokio::test]
    async fn test_concurrent_writers_conflict() {
        let (store, ids) = seeded(&[100]).await;
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();

        first.adjust_balance(ids[0], -10).await.unwrap();
        second.adjust_balance(ids[0], -20).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(
            second.commit().await,
            Err(LedgerError::Conflict(_))
        ));

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.balance(ids[0]).await.unwrap(), Balance::new(90));
    }

    #[tokio::test]
    async fn test_negative_balance_refused() {
        let (store, ids) = seeded(&[10]).await;
        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.adjust_balance(ids[0], -11).await,
            Err(LedgerError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_block_insert_conflicts_with_reader() {
        let (store, ids) = seeded(&[100, 100]).await;
        let mut reader = store.begin().await.unwrap();
        assert!(reader.block_entry(ids[0]).await.unwrap().is_none());
        reader.adjust_balance(ids[0], -5).await.unwrap();

        let mut blocker = store.begin().await.unwrap();
        blocker
            .insert_block(BlockEntry::new(ids[0], BLOCK_REASON, Duration::seconds(60)))
            .await
            .unwrap();
        blocker.commit().await.unwrap();

        assert!(matches!(
            reader.commit().await,
            Err(LedgerError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible() {
        let (store, ids) = seeded(&[100, 100]).await;
        let mut tx = store.begin().await.unwrap();
        tx.insert_block(BlockEntry::new(ids[0], BLOCK_REASON, Duration::milliseconds(-1)))
            .await
            .unwrap();
        tx.insert_anomaly(AnomalyRecord::new(
            ids[0],
            ids[1],
            None,
            Classification::Level(AnomalyLevel::Alert),
            Duration::milliseconds(-1),
        ))
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.block_entry(ids[0]).await.unwrap().is_none());
        assert!(tx.anomalies(ids[0]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_publishes_transfer_events() {
        let (store, ids) = seeded(&[100, 100]).await;
        let mut feed = store.subscribe();

        let transfer = Transfer::new(ids[0], ids[1], Amount::new(5).unwrap());
        let mut tx = store.begin().await.unwrap();
        tx.insert_transfer(transfer.clone()).await.unwrap();
        tx.commit().await.unwrap();

        let event = feed.recv().await.unwrap();
        assert_eq!(event, TransferEvent::from(&transfer));

        let mut tx = store.begin().await.unwrap();
        let later = transfer.timestamp + Duration::milliseconds(1);
        assert_eq!(tx.count_transfers_before(ids[0], ids[1], later).await.unwrap(), 1);
        assert_eq!(tx.count_transfers_before(ids[1], ids[0], later).await.unwrap(), 0);
        assert_eq!(
            tx.count_transfers_before(ids[0], ids[1], transfer.timestamp)
                .await
                .unwrap(),
            0
        );
        assert_eq!(tx.transfer(transfer.id).await.unwrap(), Some(transfer));
    }

    #[tokio::test]
    async fn test_commit_twice_is_rejected() {
        let (store, _) = seeded(&[1]).await;
        let mut tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(
            tx.commit().await,
            Err(LedgerError::ValidationError(_))
        ));
    }
}

//! PostgreSQL / CockroachDB ledger store.
//!
//! Tables are provisioned outside this crate:
//!
//! ```sql
//! CREATE TABLE accounts (id UUID PRIMARY KEY, balance INT8 NOT NULL CHECK (balance >= 0));
//! CREATE TABLE transfers (id UUID PRIMARY KEY, source UUID NOT NULL, destination UUID NOT NULL,
//!                         amount INT8 NOT NULL, ts TIMESTAMPTZ NOT NULL);
//! CREATE TABLE anomalies (id UUID PRIMARY KEY, source UUID NOT NULL, destination UUID NOT NULL,
//!                         transfer_id UUID, level STRING, reason STRING, expires_at TIMESTAMPTZ NOT NULL);
//! CREATE TABLE blocked_accounts (source UUID PRIMARY KEY, reason STRING NOT NULL,
//!                                expires_at TIMESTAMPTZ NOT NULL);
//! ```

use crate::domain::account::{Account, AccountId, Amount, Balance};
use crate::domain::anomaly::{AnomalyRecord, BlockEntry, Classification};
use crate::domain::ports::{LedgerStore, LedgerTx};
use crate::domain::transfer::{Transfer, TransferId};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use tracing::{info, warn};
use uuid::Uuid;

fn map_pg_error(e: tokio_postgres::Error) -> LedgerError {
    match e.code() {
        Some(code) if *code == SqlState::T_R_SERIALIZATION_FAILURE => {
            LedgerError::Conflict(e.to_string())
        }
        Some(code) if *code == SqlState::CHECK_VIOLATION => {
            LedgerError::ValidationError(e.to_string())
        }
        _ if e.is_closed() => LedgerError::Connectivity(e.to_string()),
        _ => LedgerError::InternalError(Box::new(e)),
    }
}

/// A ledger store backed by a pool of PostgreSQL connections.
///
/// Every transaction runs at `SERIALIZABLE`; serialization failures surface as
/// `LedgerError::Conflict` so the caller's retry loop can re-run the body.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: Pool,
}

impl PostgresLedger {
    /// Builds a pool for `url` and checks that the store answers.
    pub async fn connect(url: &str, max_size: usize) -> Result<Self> {
        let config = url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| LedgerError::Connectivity(format!("invalid connection string: {e}")))?;
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(max_size)
            .build()
            .map_err(|e| LedgerError::Connectivity(e.to_string()))?;

        let client = pool
            .get()
            .await
            .map_err(|e| LedgerError::Connectivity(e.to_string()))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(map_pg_error)?;
        info!(max_size, "connected to ledger store");

        Ok(Self { pool })
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| LedgerError::Connectivity(e.to_string()))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let client = self.client().await?;
        client
            .batch_execute("BEGIN ISOLATION LEVEL SERIALIZABLE")
            .await
            .map_err(map_pg_error)?;
        Ok(Box::new(PostgresTx {
            client: Some(client),
            finished: false,
        }))
    }

    async fn all_accounts(&self) -> Result<Vec<Account>> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT id, balance FROM accounts ORDER BY id", &[])
            .await
            .map_err(map_pg_error)?;
        rows.iter().map(account_from_row).collect()
    }
}

/// An open `SERIALIZABLE` transaction holding one pooled connection.
///
/// Dropped without a commit, the transaction is rolled back before the
/// connection goes back to the pool.
pub struct PostgresTx {
    client: Option<Object>,
    finished: bool,
}

impl PostgresTx {
    fn client(&self) -> Result<&Object> {
        match &self.client {
            Some(client) if !self.finished => Ok(client),
            _ => Err(LedgerError::ValidationError(
                "transaction already committed".to_string(),
            )),
        }
    }
}

impl Drop for PostgresTx {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(client) = self.client.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = client.batch_execute("ROLLBACK").await {
                    warn!(error = %e, "rollback failed");
                }
            });
        }
    }
}

fn account_from_row(row: &Row) -> Result<Account> {
    let id: Uuid = row.try_get("id").map_err(map_pg_error)?;
    let balance: i64 = row.try_get("balance").map_err(map_pg_error)?;
    Ok(Account::new(AccountId(id), Balance::new(balance)))
}

fn transfer_from_row(row: &Row) -> Result<Transfer> {
    let id: Uuid = row.try_get("id").map_err(map_pg_error)?;
    let source: Uuid = row.try_get("source").map_err(map_pg_error)?;
    let destination: Uuid = row.try_get("destination").map_err(map_pg_error)?;
    let amount: i64 = row.try_get("amount").map_err(map_pg_error)?;
    let timestamp: DateTime<Utc> = row.try_get("ts").map_err(map_pg_error)?;
    Ok(Transfer {
        id: TransferId(id),
        source: AccountId(source),
        destination: AccountId(destination),
        amount: Amount::new(amount)?,
        timestamp,
    })
}

fn classification_from_columns(level: Option<String>, reason: Option<String>) -> Result<Classification> {
    match (level, reason) {
        (Some(level), _) => Ok(Classification::Level(level.parse()?)),
        (None, Some(reason)) => Ok(Classification::Reason(reason)),
        (None, None) => Err(LedgerError::ValidationError(
            "anomaly row has neither level nor reason".to_string(),
        )),
    }
}

fn classification_columns(classification: &Classification) -> (Option<&str>, Option<&str>) {
    match classification {
        Classification::Level(level) => (Some(level.as_str()), None),
        Classification::Reason(reason) => (None, Some(reason.as_str())),
    }
}

fn anomaly_from_row(row: &Row) -> Result<AnomalyRecord> {
    let id: Uuid = row.try_get("id").map_err(map_pg_error)?;
    let source: Uuid = row.try_get("source").map_err(map_pg_error)?;
    let destination: Uuid = row.try_get("destination").map_err(map_pg_error)?;
    let transfer_id: Option<Uuid> = row.try_get("transfer_id").map_err(map_pg_error)?;
    let level: Option<String> = row.try_get("level").map_err(map_pg_error)?;
    let reason: Option<String> = row.try_get("reason").map_err(map_pg_error)?;
    let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(map_pg_error)?;
    Ok(AnomalyRecord {
        id,
        source: AccountId(source),
        destination: AccountId(destination),
        transfer_id: transfer_id.map(TransferId),
        classification: classification_from_columns(level, reason)?,
        expires_at,
    })
}

#[async_trait]
impl LedgerTx for PostgresTx {
    async fn block_entry(&mut self, source: AccountId) -> Result<Option<BlockEntry>> {
        let row = self
            .client()?
            .query_opt(
                "SELECT reason, expires_at FROM blocked_accounts WHERE source = $1 AND expires_at > now()",
                &[&source.0],
            )
            .await
            .map_err(map_pg_error)?;
        row.map(|row| -> Result<BlockEntry> {
            Ok(BlockEntry {
                source,
                reason: row.try_get("reason").map_err(map_pg_error)?,
                expires_at: row.try_get("expires_at").map_err(map_pg_error)?,
            })
        })
        .transpose()
    }

    async fn balance(&mut self, account: AccountId) -> Result<Balance> {
        let row = self
            .client()?
            .query_opt("SELECT balance FROM accounts WHERE id = $1", &[&account.0])
            .await
            .map_err(map_pg_error)?
            .ok_or_else(|| LedgerError::NotFound(format!("account {account}")))?;
        Ok(Balance::new(row.try_get("balance").map_err(map_pg_error)?))
    }

    async fn adjust_balance(&mut self, account: AccountId, delta: i64) -> Result<Balance> {
        let row = self
            .client()?
            .query_opt(
                "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING balance",
                &[&delta, &account.0],
            )
            .await
            .map_err(map_pg_error)?
            .ok_or_else(|| LedgerError::NotFound(format!("account {account}")))?;
        Ok(Balance::new(row.try_get("balance").map_err(map_pg_error)?))
    }

    async fn insert_account(&mut self, account: Account) -> Result<()> {
        self.client()?
            .execute(
                "INSERT INTO accounts (id, balance) VALUES ($1, $2)",
                &[&account.id.0, &account.balance.0],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn insert_transfer(&mut self, transfer: Transfer) -> Result<()> {
        let amount = transfer.amount.value();
        self.client()?
            .execute(
                "INSERT INTO transfers (id, source, destination, amount, ts) VALUES ($1, $2, $3, $4, $5)",
                &[
                    &transfer.id.0,
                    &transfer.source.0,
                    &transfer.destination.0,
                    &amount,
                    &transfer.timestamp,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn transfer(&mut self, id: TransferId) -> Result<Option<Transfer>> {
        let row = self
            .client()?
            .query_opt(
                "SELECT id, source, destination, amount, ts FROM transfers WHERE id = $1",
                &[&id.0],
            )
            .await
            .map_err(map_pg_error)?;
        row.as_ref().map(transfer_from_row).transpose()
    }

    async fn count_transfers_before(
        &mut self,
        source: AccountId,
        destination: AccountId,
        before: DateTime<Utc>,
    ) -> Result<u64> {
        let row = self
            .client()?
            .query_one(
                "SELECT count(*) AS n FROM transfers WHERE source = $1 AND destination = $2 AND ts < $3",
                &[&source.0, &destination.0, &before],
            )
            .await
            .map_err(map_pg_error)?;
        let count: i64 = row.try_get("n").map_err(map_pg_error)?;
        Ok(count.max(0) as u64)
    }

    async fn anomalies(&mut self, source: AccountId) -> Result<Vec<AnomalyRecord>> {
        let rows = self
            .client()?
            .query(
                "SELECT id, source, destination, transfer_id, level, reason, expires_at \
                 FROM anomalies WHERE source = $1 AND expires_at > now()",
                &[&source.0],
            )
            .await
            .map_err(map_pg_error)?;
        rows.iter().map(anomaly_from_row).collect()
    }

    async fn has_anomaly_for(&mut self, transfer: TransferId) -> Result<bool> {
        let row = self
            .client()?
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM anomalies WHERE transfer_id = $1 AND expires_at > now()) AS found",
                &[&transfer.0],
            )
            .await
            .map_err(map_pg_error)?;
        row.try_get("found").map_err(map_pg_error)
    }

    async fn insert_anomaly(&mut self, record: AnomalyRecord) -> Result<()> {
        let (level, reason) = classification_columns(&record.classification);
        let transfer_id = record.transfer_id.map(|id| id.0);
        self.client()?
            .execute(
                "INSERT INTO anomalies (id, source, destination, transfer_id, level, reason, expires_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &record.id,
                    &record.source.0,
                    &record.destination.0,
                    &transfer_id,
                    &level,
                    &reason,
                    &record.expires_at,
                ],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn insert_block(&mut self, entry: BlockEntry) -> Result<()> {
        self.client()?
            .execute(
                "INSERT INTO blocked_accounts (source, reason, expires_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (source) DO UPDATE SET reason = excluded.reason, expires_at = excluded.expires_at",
                &[&entry.source.0, &entry.reason, &entry.expires_at],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.client()?
            .batch_execute("COMMIT")
            .await
            .map_err(map_pg_error)?;
        self.finished = true;
        Ok(())
    }
}

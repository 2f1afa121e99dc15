use crate::application::retry::{RetryPolicy, run_with_retry};
use crate::application::stats::TransferStats;
use crate::config::TransferRules;
use crate::domain::account::{Account, AccountId, Amount};
use crate::domain::ports::SharedLedger;
use crate::domain::transfer::Transfer;
use crate::error::{LedgerError, Result};
use std::sync::Arc;

/// Moves funds between two accounts inside a retryable, serializable transaction.
///
/// The executor holds no locks of its own: the store detects conflicting transfers
/// and the executor re-runs the whole transaction body when told to.
pub struct TransferExecutor {
    store: SharedLedger,
    stats: Arc<TransferStats>,
    rules: TransferRules,
    retry: RetryPolicy,
}

impl TransferExecutor {
    pub fn new(
        store: SharedLedger,
        stats: Arc<TransferStats>,
        rules: TransferRules,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            stats,
            rules,
            retry,
        }
    }

    pub fn stats(&self) -> &Arc<TransferStats> {
        &self.stats
    }

    /// Transfers `amount` from `from` to `to`.
    ///
    /// Fails with `Blocked` if the source has an active block entry, with
    /// `InsufficientFunds` if its balance does not cover `amount`, and with
    /// `ValidationError` for a self-transfer unless those are allowed. A failed
    /// transfer leaves both balances untouched.
    pub async fn transfer(&self, from: AccountId, to: AccountId, amount: Amount) -> Result<Transfer> {
        let outcome = if from == to && !self.rules.allow_self_transfer {
            Err(LedgerError::ValidationError(format!(
                "self-transfer on account {from} is not allowed"
            )))
        } else {
            run_with_retry(&self.retry, || self.try_transfer(from, to, amount)).await
        };

        match &outcome {
            Ok(_) => self.stats.record_transfer(),
            Err(LedgerError::Blocked(..)) => self.stats.record_suspicious(),
            Err(LedgerError::InsufficientFunds { .. }) | Err(LedgerError::ValidationError(_)) => {
                self.stats.record_rejected()
            }
            Err(_) => self.stats.record_failed(),
        }
        outcome
    }

    async fn try_transfer(&self, from: AccountId, to: AccountId, amount: Amount) -> Result<Transfer> {
        let mut tx = self.store.begin().await?;

        if let Some(entry) = tx.block_entry(from).await? {
            return Err(LedgerError::Blocked(from, entry.reason));
        }

        let mut source = Account::new(from, tx.balance(from).await?);
        source.debit(amount)?;

        tx.adjust_balance(from, -amount.value()).await?;
        tx.adjust_balance(to, amount.value()).await?;

        let transfer = Transfer::new(from, to, amount);
        tx.insert_transfer(transfer.clone()).await?;
        tx.commit().await?;
        Ok(transfer)
    }
}

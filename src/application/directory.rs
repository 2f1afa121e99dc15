use crate::application::retry::{RetryPolicy, run_with_retry};
use crate::config::BalanceRange;
use crate::domain::account::{Account, AccountId, Balance};
use crate::domain::ports::SharedLedger;
use crate::error::{LedgerError, Result};
use rand::Rng;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Write-once mapping from a generated index to an account id.
///
/// Built by [`AccountDirectory::provision`] and read-only afterwards; clones share
/// the same backing slice, so any number of tasks can look accounts up without locking.
#[derive(Debug, Clone)]
pub struct AccountDirectory {
    ids: Arc<[AccountId]>,
}

impl AccountDirectory {
    pub fn from_ids(ids: Vec<AccountId>) -> Self {
        Self { ids: ids.into() }
    }

    /// Creates `count` accounts, one task per account, and waits for all of them.
    ///
    /// Ids and balances are drawn from `rng` before any task starts, so the
    /// index assigned to an account does not depend on completion order.
    /// The first failed insert aborts the remaining tasks and is returned.
    pub async fn provision<R: Rng>(
        store: SharedLedger,
        count: usize,
        balances: BalanceRange,
        rng: &mut R,
        retry: RetryPolicy,
    ) -> Result<Self> {
        if balances.min < 0 || balances.min >= balances.max {
            return Err(LedgerError::ValidationError(format!(
                "invalid balance range [{}, {})",
                balances.min, balances.max
            )));
        }
        info!(count, "creating accounts");

        let accounts: Vec<Account> = (0..count)
            .map(|_| {
                Account::new(
                    AccountId::new(),
                    Balance::new(rng.gen_range(balances.min..balances.max)),
                )
            })
            .collect();

        let mut tasks = JoinSet::new();
        for account in accounts.iter().cloned() {
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                run_with_retry(&retry, || async {
                    let mut tx = store.begin().await?;
                    tx.insert_account(account.clone()).await?;
                    tx.commit().await
                })
                .await
                .map(|_| account.id)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let id = joined
                .map_err(|e| LedgerError::InternalError(Box::new(e)))??;
            debug!(account = %id, "account created");
        }

        info!(count, "accounts created");
        Ok(Self::from_ids(accounts.into_iter().map(|a| a.id).collect()))
    }

    /// Fails with `NotFound` if `index` is outside the provisioned range.
    pub fn lookup(&self, index: usize) -> Result<AccountId> {
        self.ids.get(index).copied().ok_or_else(|| {
            LedgerError::NotFound(format!(
                "account index {index} (directory holds {})",
                self.ids.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

use crate::application::directory::AccountDirectory;
use crate::application::executor::TransferExecutor;
use crate::application::stats::StatsSnapshot;
use crate::domain::account::{AccountId, Amount};
use crate::error::{LedgerError, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadConfig {
    pub duration: Duration,
    pub wait: Duration,
    /// Indices are drawn from `0..accounts`.
    pub accounts: usize,
    pub min_amount: i64,
    /// Exclusive.
    pub max_amount: i64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(3600),
            wait: Duration::from_millis(1000),
            accounts: 100,
            min_amount: 1,
            max_amount: 1000,
        }
    }
}

/// Drives random transfers through the executor until a deadline or shutdown.
pub struct WorkloadGenerator<R> {
    executor: Arc<TransferExecutor>,
    directory: AccountDirectory,
    config: WorkloadConfig,
    rng: R,
}

impl<R: Rng + Send> WorkloadGenerator<R> {
    pub fn new(
        executor: Arc<TransferExecutor>,
        directory: AccountDirectory,
        config: WorkloadConfig,
        rng: R,
    ) -> Self {
        Self {
            executor,
            directory,
            config,
            rng,
        }
    }

    /// Runs for the configured duration, or until `shutdown` flips to `true`.
    ///
    /// A transfer already in flight when the deadline passes is allowed to finish.
    /// Failing to resolve an account index is fatal and returned as `NotFound`;
    /// every other transfer failure is logged and the loop carries on.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<StatsSnapshot> {
        let deadline = Instant::now()
            .checked_add(self.config.duration)
            .ok_or_else(|| {
                LedgerError::ValidationError(format!(
                    "workload duration {:?} is out of range",
                    self.config.duration
                ))
            })?;
        info!(
            duration = ?self.config.duration,
            accounts = self.directory.len(),
            "starting transfers"
        );

        while Instant::now() < deadline && !*shutdown.borrow() {
            let (from, to) = match self.pick_accounts() {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "account lookup failed; stopping workload");
                    return Err(e);
                }
            };
            let raw = self
                .rng
                .gen_range(self.config.min_amount..self.config.max_amount);

            match Amount::new(raw) {
                Ok(amount) => match self.executor.transfer(from, to, amount).await {
                    Ok(transfer) => info!(
                        from = %from,
                        to = %to,
                        amount = %amount,
                        transfer = %transfer.id,
                        "transfer done"
                    ),
                    Err(e) => warn!(from = %from, to = %to, amount = %amount, error = %e, "transfer failed"),
                },
                Err(e) => warn!(error = %e, "skipping transfer"),
            }

            debug!(wait = ?self.config.wait, "waiting");
            tokio::select! {
                _ = sleep(self.config.wait) => {}
                _ = sleep_until(deadline) => break,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let snapshot = self.executor.stats().snapshot();
        info!("{snapshot}");
        Ok(snapshot)
    }

    fn pick_accounts(&mut self) -> Result<(AccountId, AccountId)> {
        let range = 0..self.config.accounts.max(1);
        let from = self.directory.lookup(self.rng.gen_range(range.clone()))?;
        let to = self.directory.lookup(self.rng.gen_range(range))?;
        Ok((from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::retry::RetryPolicy;
    use crate::application::stats::TransferStats;
    use crate::config::{BalanceRange, TransferRules};
    use crate::domain::account::Balance;
    use crate::domain::ports::SharedLedger;
    use crate::infrastructure::in_memory::InMemoryLedger;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    async fn setup(accounts: usize) -> (SharedLedger, Arc<TransferExecutor>, AccountDirectory) {
        let store: SharedLedger = Arc::new(InMemoryLedger::new());
        let mut rng = StdRng::seed_from_u64(1);
        let directory = AccountDirectory::provision(
            Arc::clone(&store),
            accounts,
            BalanceRange::default(),
            &mut rng,
            RetryPolicy::default(),
        )
        .await
        .unwrap();
        let executor = Arc::new(TransferExecutor::new(
            Arc::clone(&store),
            Arc::new(TransferStats::new()),
            TransferRules::default(),
            RetryPolicy::default(),
        ));
        (store, executor, directory)
    }

    #[tokio::test]
    async fn test_run_until_deadline_conserves_funds() {
        let (store, executor, directory) = setup(5).await;
        let before: Balance = store
            .all_accounts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.balance)
            .sum();

        let config = WorkloadConfig {
            duration: Duration::from_millis(200),
            wait: Duration::from_millis(5),
            accounts: 5,
            ..WorkloadConfig::default()
        };
        let (_stop, shutdown) = watch::channel(false);
        let snapshot = WorkloadGenerator::new(executor, directory, config, StdRng::seed_from_u64(9))
            .run(shutdown)
            .await
            .unwrap();

        assert!(snapshot.attempted() > 0);
        let after: Balance = store
            .all_accounts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.balance)
            .sum();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_unknown_index_is_fatal() {
        let (_store, executor, directory) = setup(2).await;
        let config = WorkloadConfig {
            duration: Duration::from_secs(60),
            wait: Duration::from_millis(1),
            accounts: 1000,
            ..WorkloadConfig::default()
        };
        let (_stop, shutdown) = watch::channel(false);
        let result = WorkloadGenerator::new(executor, directory, config, StdRng::seed_from_u64(3))
            .run(shutdown)
            .await;
        assert!(matches!(result, Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unrepresentable_duration_is_rejected() {
        let (_store, executor, directory) = setup(2).await;
        let config = WorkloadConfig {
            duration: Duration::from_secs(u64::MAX),
            accounts: 2,
            ..WorkloadConfig::default()
        };
        let (_stop, shutdown) = watch::channel(false);
        let result = WorkloadGenerator::new(executor, directory, config, StdRng::seed_from_u64(3))
            .run(shutdown)
            .await;
        assert!(matches!(result, Err(LedgerError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_run() {
        let (_store, executor, directory) = setup(3).await;
        let config = WorkloadConfig {
            duration: Duration::from_secs(3600),
            wait: Duration::from_secs(3600),
            accounts: 3,
            ..WorkloadConfig::default()
        };
        let (stop, shutdown) = watch::channel(false);
        let handle = tokio::spawn(
            WorkloadGenerator::new(executor, directory, config, StdRng::seed_from_u64(5)).run(shutdown),
        );
        stop.send(true).unwrap();
        let snapshot = handle.await.unwrap().unwrap();
        assert!(snapshot.attempted() <= 1);
    }
}

#![allow(dead_code)]

use chrono::Duration;
use ledgerwatch::application::classifier::VelocityClassifier;
use ledgerwatch::application::escalation::EscalationPolicy;
use ledgerwatch::application::executor::TransferExecutor;
use ledgerwatch::application::pipeline::FraudPipeline;
use ledgerwatch::application::retry::RetryPolicy;
use ledgerwatch::application::stats::TransferStats;
use ledgerwatch::config::TransferRules;
use ledgerwatch::domain::account::{Account, AccountId, Balance};
use ledgerwatch::domain::ports::SharedLedger;
use ledgerwatch::infrastructure::in_memory::InMemoryLedger;
use std::sync::Arc;

/// A fresh in-memory ledger with one account per entry in `balances`.
pub async fn ledger_with(balances: &[i64]) -> (InMemoryLedger, Vec<AccountId>) {
    let ledger = InMemoryLedger::new();
    let store: SharedLedger = Arc::new(ledger.clone());
    let mut tx = store.begin().await.unwrap();
    let mut ids = Vec::with_capacity(balances.len());
    for balance in balances {
        let id = AccountId::new();
        tx.insert_account(Account::new(id, Balance::new(*balance)))
            .await
            .unwrap();
        ids.push(id);
    }
    tx.commit().await.unwrap();
    (ledger, ids)
}

pub fn patient_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1000,
        ..RetryPolicy::default()
    }
}

pub fn executor(store: SharedLedger, retry: RetryPolicy) -> TransferExecutor {
    TransferExecutor::new(
        store,
        Arc::new(TransferStats::new()),
        TransferRules::default(),
        retry,
    )
}

pub fn velocity_pipeline(store: SharedLedger, escalation: EscalationPolicy) -> FraudPipeline {
    FraudPipeline::new(
        store,
        Box::new(VelocityClassifier),
        escalation,
        Duration::hours(1),
        RetryPolicy::default(),
    )
}

pub async fn total_balance(store: &SharedLedger) -> i64 {
    store
        .all_accounts()
        .await
        .unwrap()
        .iter()
        .map(|account| account.balance.0)
        .sum()
}

pub async fn balance_of(store: &SharedLedger, account: AccountId) -> i64 {
    let mut tx = store.begin().await.unwrap();
    tx.balance(account).await.unwrap().0
}

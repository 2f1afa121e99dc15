//! Process-wide configuration, read once at startup.

use crate::application::escalation::EscalationPolicy;
use crate::application::retry::RetryPolicy;
use crate::application::workload::WorkloadConfig;
use crate::error::{LedgerError, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::time::{Duration, Instant};

/// Smallest number of accounts a run will provision.
pub const MIN_ACCOUNTS: usize = 2;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Number of seconds to run the transfer workload
    #[arg(short = 'd', long, default_value_t = 3600)]
    pub duration: u64,

    /// Wait between transfers, in milliseconds
    #[arg(short = 'w', long, default_value_t = 1000)]
    pub wait: u64,

    /// Number of accounts to create (at least 2)
    #[arg(short = 'a', long, default_value_t = 100)]
    pub accounts: usize,

    /// Port the ingestion endpoint listens on
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Ledger store connection string. Unset or "memory" uses the in-memory store.
    #[arg(long, env = "DB")]
    pub database_url: Option<String>,

    /// Fraud classification policy
    #[arg(long, value_enum, default_value_t = FraudPolicy::Velocity)]
    pub policy: FraudPolicy,

    /// Accumulated anomaly weight at which a source account is blocked
    #[arg(long, default_value_t = 20)]
    pub block_threshold: u32,

    /// Prior transfers between one pair of accounts tolerated by the repetition policy
    #[arg(long, default_value_t = 4)]
    pub repetition_threshold: u64,

    /// Anomaly retention, in seconds
    #[arg(long, default_value_t = 3600)]
    pub anomaly_ttl: u64,

    /// Block retention, in seconds
    #[arg(long, default_value_t = 3600)]
    pub block_ttl: u64,

    /// What to do with the rest of an ingestion batch after a malformed line
    #[arg(long, value_enum, default_value_t = MalformedLinePolicy::Abort)]
    pub on_malformed: MalformedLinePolicy,

    /// Permit transfers whose source and destination are the same account
    #[arg(long)]
    pub allow_self_transfer: bool,

    /// Upper bound on concurrently running classifications
    #[arg(long, default_value_t = 64)]
    pub max_in_flight: u32,

    /// Attempts per transaction before a conflict is surfaced
    #[arg(long, default_value_t = 25)]
    pub max_attempts: u32,

    /// Seed for the workload's random generator
    #[arg(long)]
    pub seed: Option<u64>,

    /// Do not feed committed transfers from the in-memory store into the fraud pipeline
    #[arg(long)]
    pub no_feed: bool,

    /// Stop serving once the workload finishes instead of waiting for Ctrl-C
    #[arg(long)]
    pub exit_on_complete: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn account_count(&self) -> usize {
        self.accounts.max(MIN_ACCOUNTS)
    }

    pub fn transfer_rules(&self) -> TransferRules {
        TransferRules {
            allow_self_transfer: self.allow_self_transfer,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            ..RetryPolicy::default()
        }
    }

    pub fn escalation_policy(&self) -> Result<EscalationPolicy> {
        Ok(EscalationPolicy::new(
            self.block_threshold,
            ttl("block-ttl", self.block_ttl)?,
        ))
    }

    pub fn anomaly_ttl(&self) -> Result<chrono::Duration> {
        ttl("anomaly-ttl", self.anomaly_ttl)
    }

    /// Fails if the run would end past what the clock can represent.
    pub fn workload(&self) -> Result<WorkloadConfig> {
        let duration = Duration::from_secs(self.duration);
        if Instant::now().checked_add(duration).is_none() {
            return Err(LedgerError::ValidationError(format!(
                "--duration {} is out of range",
                self.duration
            )));
        }
        Ok(WorkloadConfig {
            duration,
            wait: Duration::from_millis(self.wait),
            accounts: self.account_count(),
            ..WorkloadConfig::default()
        })
    }

    /// The store connection string, or `None` for the in-memory store.
    pub fn connection_string(&self) -> Option<&str> {
        self.database_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty() && *url != "memory")
    }
}

/// A retention of `seconds`, rejected if an entry written now could not store its expiry.
fn ttl(flag: &str, seconds: u64) -> Result<chrono::Duration> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .filter(|ttl| Utc::now().checked_add_signed(*ttl).is_some())
        .ok_or_else(|| LedgerError::ValidationError(format!("--{flag} {seconds} is out of range")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FraudPolicy {
    /// Classify each transfer by its amount
    Velocity,
    /// Flag account pairs that transfer to each other repeatedly
    Repetition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MalformedLinePolicy {
    /// Stop processing the batch at the first malformed line
    #[default]
    Abort,
    /// Log the malformed line and continue with the next one
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferRules {
    pub allow_self_transfer: bool,
}

/// Range initial balances are drawn from, `min` inclusive, `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceRange {
    pub min: i64,
    pub max: i64,
}

impl Default for BalanceRange {
    fn default() -> Self {
        Self {
            min: 10,
            max: 1_000_000,
        }
    }
}

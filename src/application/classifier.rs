use crate::config::FraudPolicy;
use crate::domain::anomaly::{AnomalyLevel, Classification};
use crate::domain::event::TransferEvent;
use crate::domain::ports::LedgerTx;
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;

pub const REPETITION_REASON: &str = "repeated transfers between the same accounts";

/// Decides whether an observed transfer is anomalous.
///
/// Classifiers only read; the pipeline records whatever they return. A missing
/// transfer or an empty history is never an error, just "no anomaly".
#[async_trait]
pub trait FraudClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn classify(
        &self,
        tx: &mut dyn LedgerTx,
        event: &TransferEvent,
    ) -> Result<Option<Classification>>;
}

/// Grades a transfer by its amount.
#[derive(Debug, Default, Clone, Copy)]
pub struct VelocityClassifier;

#[async_trait]
impl FraudClassifier for VelocityClassifier {
    fn name(&self) -> &'static str {
        "velocity"
    }

    async fn classify(
        &self,
        tx: &mut dyn LedgerTx,
        event: &TransferEvent,
    ) -> Result<Option<Classification>> {
        let Some(transfer) = tx.transfer(event.id).await? else {
            return Ok(None);
        };
        Ok(match AnomalyLevel::from_amount(transfer.amount) {
            AnomalyLevel::Ok => None,
            level => Some(Classification::Level(level)),
        })
    }
}

/// Flags a pair of accounts once they have transferred to each other more than
/// `threshold` times before the transfer being classified.
#[derive(Debug, Clone, Copy)]
pub struct RepetitionClassifier {
    threshold: u64,
}

impl RepetitionClassifier {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }
}

impl Default for RepetitionClassifier {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl FraudClassifier for RepetitionClassifier {
    fn name(&self) -> &'static str {
        "repetition"
    }

    async fn classify(
        &self,
        tx: &mut dyn LedgerTx,
        event: &TransferEvent,
    ) -> Result<Option<Classification>> {
        // An unknown trigger is measured against everything committed so far.
        let before = match tx.transfer(event.id).await? {
            Some(t) if t.source == event.source && t.destination == event.destination => {
                t.timestamp
            }
            _ => Utc::now(),
        };
        let prior = tx
            .count_transfers_before(event.source, event.destination, before)
            .await?;
        Ok((prior > self.threshold).then(|| Classification::Reason(REPETITION_REASON.to_string())))
    }
}

impl FraudPolicy {
    pub fn classifier(self, repetition_threshold: u64) -> Box<dyn FraudClassifier> {
        match self {
            FraudPolicy::Velocity => Box::new(VelocityClassifier),
            FraudPolicy::Repetition => Box::new(RepetitionClassifier::new(repetition_threshold)),
        }
    }
}

use crate::domain::account::AccountId;
use crate::domain::anomaly::{BLOCK_REASON, BlockEntry};
use crate::domain::ports::LedgerTx;
use crate::error::Result;
use chrono::Duration;
use tracing::info;

/// Blocks source accounts whose accumulated anomaly weight reaches a threshold.
///
/// `Unblocked -> Blocked` is the only transition this policy makes; a block ends
/// only when its entry expires.
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    threshold: u32,
    block_ttl: Duration,
}

impl EscalationPolicy {
    pub fn new(threshold: u32, block_ttl: Duration) -> Self {
        Self {
            threshold,
            block_ttl,
        }
    }

    /// Sum of the weights of every non-expired anomaly recorded against `source`.
    pub async fn weight(&self, tx: &mut dyn LedgerTx, source: AccountId) -> Result<u32> {
        Ok(tx
            .anomalies(source)
            .await?
            .iter()
            .map(|record| record.classification.weight())
            .sum())
    }

    /// Inserts a block entry for `source` if its weight has reached the threshold
    /// and it is not already blocked. Returns the new entry, if any.
    pub async fn evaluate(
        &self,
        tx: &mut dyn LedgerTx,
        source: AccountId,
    ) -> Result<Option<BlockEntry>> {
        if tx.block_entry(source).await?.is_some() {
            return Ok(None);
        }

        let weight = self.weight(tx, source).await?;
        if weight < self.threshold {
            return Ok(None);
        }

        let entry = BlockEntry::new(source, BLOCK_REASON, self.block_ttl);
        tx.insert_block(entry.clone()).await?;
        info!(account = %source, weight, threshold = self.threshold, "blocking account");
        Ok(Some(entry))
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new(20, Duration::hours(1))
    }
}

use crate::application::classifier::FraudClassifier;
use crate::application::escalation::EscalationPolicy;
use crate::application::retry::{RetryPolicy, run_with_retry};
use crate::domain::account::AccountId;
use crate::domain::anomaly::{AnomalyRecord, BlockEntry};
use crate::domain::event::TransferEvent;
use crate::domain::ports::SharedLedger;
use crate::error::Result;
use chrono::Duration;
use tracing::{info, warn};

/// What happened to one event as it went through the pipeline.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub anomaly: Option<AnomalyRecord>,
    pub block: Option<BlockEntry>,
}

/// Classification followed by escalation, each in its own transaction.
pub struct FraudPipeline {
    store: SharedLedger,
    classifier: Box<dyn FraudClassifier>,
    escalation: EscalationPolicy,
    anomaly_ttl: Duration,
    retry: RetryPolicy,
}

impl FraudPipeline {
    pub fn new(
        store: SharedLedger,
        classifier: Box<dyn FraudClassifier>,
        escalation: EscalationPolicy,
        anomaly_ttl: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            classifier,
            escalation,
            anomaly_ttl,
            retry,
        }
    }

    /// Classifies `event` and records an anomaly if the classifier finds one.
    ///
    /// Redelivered events are recognised by their transfer id and skipped, so
    /// running this more than once for the same transfer records at most one anomaly.
    pub async fn classify(&self, event: &TransferEvent) -> Result<Option<AnomalyRecord>> {
        run_with_retry(&self.retry, || async {
            let mut tx = self.store.begin().await?;
            if tx.has_anomaly_for(event.id).await? {
                return Ok(None);
            }
            let Some(classification) = self.classifier.classify(tx.as_mut(), event).await? else {
                return Ok(None);
            };
            let record = AnomalyRecord::new(
                event.source,
                event.destination,
                Some(event.id),
                classification,
                self.anomaly_ttl,
            );
            tx.insert_anomaly(record.clone()).await?;
            tx.commit().await?;
            Ok(Some(record))
        })
        .await
    }

    pub async fn escalate(&self, source: AccountId) -> Result<Option<BlockEntry>> {
        run_with_retry(&self.retry, || async {
            let mut tx = self.store.begin().await?;
            let entry = self.escalation.evaluate(tx.as_mut(), source).await?;
            if entry.is_some() {
                tx.commit().await?;
            }
            Ok(entry)
        })
        .await
    }

    /// Runs both stages for one event. Failures are logged and the unit of work is
    /// abandoned; escalation runs even if classification failed.
    pub async fn process(&self, event: &TransferEvent) -> PipelineOutcome {
        let anomaly = match self.classify(event).await {
            Ok(anomaly) => anomaly,
            Err(e) => {
                warn!(transfer = %event.id, error = %e, "classification failed");
                None
            }
        };
        if let Some(record) = &anomaly {
            info!(
                transfer = %event.id,
                source = %record.source,
                classifier = self.classifier.name(),
                classification = ?record.classification,
                "anomaly recorded"
            );
        }

        let block = match self.escalate(event.source).await {
            Ok(block) => block,
            Err(e) => {
                warn!(account = %event.source, error = %e, "escalation failed");
                None
            }
        };

        PipelineOutcome { anomaly, block }
    }
}

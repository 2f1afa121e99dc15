use crate::application::pipeline::FraudPipeline;
use crate::domain::event::TransferEvent;
use crate::error::{LedgerError, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{Semaphore, broadcast, watch};
use tracing::{debug, info, warn};

/// Hands events to the fraud pipeline, one task per event.
///
/// Callers do not wait for classification to finish, but at most `capacity`
/// classifications run at once; `dispatch` waits for a free slot when the pool
/// is saturated. `drain` waits for everything in flight.
#[derive(Clone)]
pub struct EventDispatcher {
    pipeline: Arc<FraudPipeline>,
    permits: Arc<Semaphore>,
    capacity: u32,
}

impl EventDispatcher {
    pub fn new(pipeline: Arc<FraudPipeline>, capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    pub async fn dispatch(&self, event: TransferEvent) -> Result<()> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| LedgerError::InternalError(Box::new(e)))?;
        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            pipeline.process(&event).await;
            drop(permit);
        });
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.capacity as usize - self.permits.available_permits()
    }

    /// Waits until every dispatched event has been processed.
    pub async fn drain(&self) -> Result<()> {
        let all = self
            .permits
            .acquire_many(self.capacity)
            .await
            .map_err(|e| LedgerError::InternalError(Box::new(e)))?;
        drop(all);
        Ok(())
    }

    /// Dispatches every event received on `feed` until `shutdown` flips to `true`
    /// or the feed closes. Events already buffered in `feed` at shutdown are still
    /// dispatched, so a later `drain` covers them.
    pub async fn forward(
        self,
        mut feed: broadcast::Receiver<TransferEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("forwarding committed transfers to the fraud pipeline");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                received = feed.recv() => match received {
                    Ok(event) => {
                        debug!(transfer = %event.id, "change notification");
                        if let Err(e) = self.dispatch(event).await {
                            warn!(error = %e, "dispatch failed");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "change feed lagged; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.flush(&mut feed).await;
    }

    async fn flush(&self, feed: &mut broadcast::Receiver<TransferEvent>) {
        let mut flushed = 0usize;
        loop {
            match feed.try_recv() {
                Ok(event) => {
                    if let Err(e) = self.dispatch(event).await {
                        warn!(error = %e, "dispatch failed");
                        break;
                    }
                    flushed += 1;
                }
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(missed, "change feed lagged; events dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        if flushed > 0 {
            debug!(flushed, "dispatched buffered change notifications");
        }
    }
}

mod common;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use common::{executor, ledger_with, velocity_pipeline};
use ledgerwatch::application::dispatcher::EventDispatcher;
use ledgerwatch::application::escalation::EscalationPolicy;
use ledgerwatch::config::MalformedLinePolicy;
use ledgerwatch::domain::account::{AccountId, Amount};
use ledgerwatch::domain::anomaly::{AnomalyLevel, Classification};
use ledgerwatch::domain::event::TransferEvent;
use ledgerwatch::domain::ports::SharedLedger;
use ledgerwatch::domain::transfer::Transfer;
use ledgerwatch::interfaces::ingest::server::{IngestResponse, IngestState, router};
use std::sync::Arc;
use tower::ServiceExt;

struct Harness {
    store: SharedLedger,
    dispatcher: EventDispatcher,
    app: Router,
    accounts: Vec<AccountId>,
}

async fn harness(on_malformed: MalformedLinePolicy) -> Harness {
    let (ledger, accounts) = ledger_with(&[100_000, 100_000]).await;
    let store: SharedLedger = Arc::new(ledger);
    let pipeline = Arc::new(velocity_pipeline(
        Arc::clone(&store),
        EscalationPolicy::default(),
    ));
    let dispatcher = EventDispatcher::new(pipeline, 4);
    let app = router(IngestState {
        dispatcher: dispatcher.clone(),
        on_malformed,
    });
    Harness {
        store,
        dispatcher,
        app,
        accounts,
    }
}

impl Harness {
    async fn transfer(&self, amount: i64) -> Transfer {
        executor(Arc::clone(&self.store), Default::default())
            .transfer(self.accounts[0], self.accounts[1], Amount::new(amount).unwrap())
            .await
            .unwrap()
    }

    async fn post(&self, body: String) -> (StatusCode, IngestResponse) {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from(body))
            .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

fn line(transfer: &Transfer) -> String {
    serde_json::to_string(&TransferEvent::from(transfer)).unwrap()
}

#[tokio::test]
async fn test_valid_batch_is_classified() {
    let h = harness(MalformedLinePolicy::Abort).await;
    let warning = h.transfer(750).await;
    let quiet = h.transfer(20).await;

    let body = format!("{}\n\n{}\n", line(&warning), line(&quiet));
    let (status, summary) = h.post(body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        summary,
        IngestResponse {
            accepted: 2,
            rejected: 0,
            aborted: false
        }
    );

    h.dispatcher.drain().await.unwrap();
    let mut tx = h.store.begin().await.unwrap();
    let anomalies = tx.anomalies(h.accounts[0]).await.unwrap();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].transfer_id, Some(warning.id));
    assert_eq!(
        anomalies[0].classification,
        Classification::Level(AnomalyLevel::Warning)
    );
}

#[tokio::test]
async fn test_malformed_line_aborts_rest_of_batch() {
    let h = harness(MalformedLinePolicy::Abort).await;
    let first = h.transfer(1500).await;
    let last = h.transfer(1500).await;

    let body = format!("{}\nnot json\n{}\n", line(&first), line(&last));
    let (status, summary) = h.post(body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        summary,
        IngestResponse {
            accepted: 1,
            rejected: 1,
            aborted: true
        }
    );

    h.dispatcher.drain().await.unwrap();
    let mut tx = h.store.begin().await.unwrap();
    assert!(tx.has_anomaly_for(first.id).await.unwrap());
    assert!(!tx.has_anomaly_for(last.id).await.unwrap());
    drop(tx);

    // The endpoint keeps serving after a bad batch.
    let (status, summary) = h.post(line(&last)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary.accepted, 1);
}

#[tokio::test]
async fn test_skip_policy_continues_past_malformed_lines() {
    let h = harness(MalformedLinePolicy::Skip).await;
    let first = h.transfer(1500).await;
    let last = h.transfer(1500).await;

    let body = format!("{}\n{{\"id\": 7}}\n{}", line(&first), line(&last));
    let (status, summary) = h.post(body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        summary,
        IngestResponse {
            accepted: 2,
            rejected: 1,
            aborted: false
        }
    );

    h.dispatcher.drain().await.unwrap();
    let mut tx = h.store.begin().await.unwrap();
    assert_eq!(tx.anomalies(h.accounts[0]).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_redelivered_batch_is_idempotent() {
    let h = harness(MalformedLinePolicy::Abort).await;
    let transfer = h.transfer(1500).await;

    for _ in 0..3 {
        let (status, _) = h.post(line(&transfer)).await;
        assert_eq!(status, StatusCode::OK);
        h.dispatcher.drain().await.unwrap();
    }

    let mut tx = h.store.begin().await.unwrap();
    assert_eq!(tx.anomalies(h.accounts[0]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_empty_body_is_accepted() {
    let h = harness(MalformedLinePolicy::Abort).await;
    let (status, summary) = h.post(String::new()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary, IngestResponse::default());
    assert_eq!(h.dispatcher.in_flight(), 0);
}

use super::event_reader::EventReader;
use crate::application::dispatcher::EventDispatcher;
use crate::config::MalformedLinePolicy;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shared state of the ingestion endpoint.
#[derive(Clone)]
pub struct IngestState {
    pub dispatcher: EventDispatcher,
    pub on_malformed: MalformedLinePolicy,
}

/// Per-request summary returned to the change feed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub rejected: usize,
    pub aborted: bool,
}

pub fn router(state: IngestState) -> Router {
    Router::new().route("/", post(ingest)).with_state(state)
}

/// POST / - one JSON transfer event per line.
///
/// Events are dispatched as they are read; the response does not wait for
/// classification. With `MalformedLinePolicy::Abort` the first malformed line ends
/// the batch, leaving the events before it dispatched.
async fn ingest(State(state): State<IngestState>, body: String) -> impl IntoResponse {
    let mut summary = IngestResponse::default();

    for parsed in EventReader::new(&body).events() {
        match parsed {
            Ok(event) => {
                if let Err(e) = state.dispatcher.dispatch(event).await {
                    warn!(error = %e, "dispatch failed");
                    return (StatusCode::SERVICE_UNAVAILABLE, Json(summary));
                }
                summary.accepted += 1;
            }
            Err(e) => {
                warn!(error = %e, "JSON parse error");
                summary.rejected += 1;
                if state.on_malformed == MalformedLinePolicy::Abort {
                    summary.aborted = true;
                    break;
                }
            }
        }
    }

    let status = if summary.rejected == 0 {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(summary))
}

/// Serves `router` on `listener` until `shutdown` flips to `true`.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "ingestion endpoint listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}

//! `GET /stream/inventory`: server-sent inventory changes.
//!
//! Each connection registers one observer on the fan-out. A task pumps the
//! observer's frames (including heartbeats) into a channel backing the SSE
//! body, and unregisters the observer once the client is gone.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Router,
    extract::Extension,
    response::sse::{Event as SseEvent, Sse},
    routing::get,
};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use pharmaflow_infra::fanout::FanOutFrame;
use pharmaflow_infra::ledger::StockLedger;

use crate::app::dto::AvailabilityResponse;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/inventory", get(inventory_stream))
}

pub async fn inventory_stream(
    Extension(services): Extension<Arc<AppServices>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let mut observer = services.fanout.register();
    let observer_id = observer.id();
    let (tx, rx) = mpsc::channel::<FanOutFrame>(services.fanout.config().capacity);

    // No resume token: a (re)connecting client starts from a full snapshot.
    let snapshot = match services.ledger.snapshot() {
        Ok(stock) => {
            let products: Vec<AvailabilityResponse> =
                stock.into_iter().map(AvailabilityResponse::from).collect();
            FanOutFrame::new("snapshot", &products).ok()
        }
        Err(err) => {
            warn!(observer = %observer_id, error = %err, "inventory snapshot unavailable");
            None
        }
    };

    let fanout = services.fanout.clone();
    tokio::spawn(async move {
        let mut connected = match snapshot {
            Some(frame) => tx.send(frame).await.is_ok(),
            None => true,
        };
        while connected {
            match observer.next_frame().await {
                Some(frame) => connected = tx.send(frame).await.is_ok(),
                None => break,
            }
        }
        fanout.unregister(observer_id);
        debug!(observer = %observer_id, "observer disconnected");
    });

    let stream = ReceiverStream::new(rx).map(|frame| {
        Ok(SseEvent::default()
            .event(frame.event.as_str())
            .data(frame.data_string()))
    });
    Sse::new(stream)
}

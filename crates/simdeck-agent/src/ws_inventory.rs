//! WebSocket handler for live inventory updates.
//!
//! Endpoint: GET /ws
//!
//! Clients receive one `modem.snapshot` envelope with every known modem,
//! then a `modem.added` / `modem.removed` envelope per hot-plug event.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::StreamExt;
use futures::SinkExt;

use simdeck_common::protocol::{InventoryEvent, SnapshotPayload};

use crate::state::AppState;

/// Axum handler; upgrades HTTP to WebSocket.
pub async fn handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Subscribe before taking the snapshot so nothing falls in between.
    let mut inventory_rx = state.subscribe_inventory();

    tracing::debug!("inventory client connected");

    let modems = match state.registry().modems().await {
        Ok(snapshot) => snapshot.values().cloned().collect(),
        Err(e) => {
            tracing::warn!(error = %e, "modem enumeration failed, sending cached inventory");
            state.registry().snapshot().values().cloned().collect()
        }
    };
    let snapshot = InventoryEvent::Snapshot(SnapshotPayload { modems });
    if send_event(&mut ws_tx, &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = inventory_rx.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut ws_tx, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("inventory client lagged, dropped {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    tracing::debug!("inventory client disconnected");
}

async fn send_event<S>(ws_tx: &mut S, event: &InventoryEvent) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(&event.to_envelope()) {
        Ok(j) => j,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize inventory event");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await.map_err(|_| ())
}

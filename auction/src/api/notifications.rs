//! WebSocket push of auction notifications.
//!
//! ```text
//! Client          handler                 NotificationFanout
//!   │                │                          │
//!   ├─ Connect ─────>│                          │
//!   │                ├─ subscribe() ───────────>│
//!   │                │<── broadcast ────────────┤
//!   │<─ {"type":..} ─┤                          │
//! ```
//!
//! Push is at-most-once. A client that falls behind the channel capacity
//! receives `{"type":"Lagged","data":{"missed":n}}` and should re-query
//! `/api/search`.

use super::state::AppState;
use crate::fanout::Notification;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// Upgrade to a notification stream.
#[allow(clippy::unused_async)] // Axum handler signature requires async
pub async fn notifications(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_notifications(socket, state))
}

fn to_text(notification: &Notification) -> Option<Message> {
    match serde_json::to_string(notification) {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            error!(error = %e, "Failed to serialize notification");
            None
        }
    }
}

async fn stream_notifications(socket: WebSocket, state: AppState) {
    info!(receivers = state.fanout.receiver_count() + 1, "Notification client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut notifications = state.fanout.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            let message = match notifications.recv().await {
                Ok(notification) => match to_text(&notification) {
                    Some(message) => message,
                    None => continue,
                },
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Notification client lagged");
                    Message::Text(json!({"type": "Lagged", "data": {"missed": missed}}).to_string())
                }
                Err(RecvError::Closed) => break,
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
        debug!("Notification send task terminated");
    });

    // Inbound frames are ignored; the loop only watches for the close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    info!("Notification client disconnected");
}

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::Broker;
use crate::wire;
use crate::wire::protocol::{ClientEvent, ErrorReason};

use super::AppState;

/// GET /queue/{job_id}: upgrade to a job's event stream.
pub async fn queue_ws(
    ws: WebSocketUpgrade,
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_client(socket, job_id, state.broker))
}

async fn handle_client(socket: WebSocket, job_id: String, broker: Arc<Broker>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let (key, session_id) = match broker.subscribe_client(&job_id, tx).await {
        Ok(sub) => sub,
        Err(_) => {
            // one error frame, then close
            if let Some(frame) = wire::encode(&ClientEvent::Error {
                reason: ErrorReason::UnknownJob,
            }) {
                let _ = sender.send(Message::Text(frame.into())).await;
            }
            let _ = sender.close().await;
            return;
        },
    };

    // subscribe_client already pushed the initial queue position; from here
    // the forwarder owns the write half
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // the channel is push-only: whatever the client sends is discarded
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(_) => {},
            Err(error) => {
                debug!(job = %job_id, %error, "client socket error");
                break;
            },
        }
    }

    send_task.abort();
    broker.client_gone(&job_id, &session_id, key).await;
}

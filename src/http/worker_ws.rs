use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::wire;
use crate::wire::protocol::{WorkerCmd, WorkerMsg};

use super::AppState;

/// GET /worker: upgrade to the worker signalling channel.
pub async fn worker_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_worker(socket, state))
}

async fn handle_worker(socket: WebSocket, state: AppState) {
    let AppState {
        broker,
        hello_timeout,
    } = state;
    let (mut sender, mut receiver) = socket.split();

    // Handshake: the hello may carry the worker's preferred id. A timeout,
    // a non-text frame, or an unparseable one just means the broker picks.
    let requested_id = match timeout(hello_timeout, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str(&text) {
            Ok(WorkerMsg::Hello { worker_id }) => worker_id,
            Ok(_) => {
                debug!("first worker frame was not a hello");
                None
            },
            Err(_) => None,
        },
        Ok(Some(Ok(_))) => None,
        // socket already gone: nothing was registered, nothing to clean up
        Ok(Some(Err(_))) | Ok(None) => return,
        Err(_) => None,
    };

    // The forwarder task owns the write half; everything the broker wants to
    // tell this worker goes through the channel, in push order.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let worker_id = broker.register_worker(requested_id, tx.clone()).await;

    let acked = wire::encode(&WorkerCmd::HelloAck {
        worker_id: worker_id.clone(),
    })
    .map(|frame| tx.send(frame).is_ok())
    .unwrap_or(false);
    if !acked {
        send_task.abort();
        broker.worker_disconnected(&worker_id).await;
        return;
    }

    // a new worker may unblock the queue
    broker.assign_if_possible().await;

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&broker, &worker_id, &text).await,
            Ok(Message::Close(_)) => break,
            // pings and pongs are handled by the library; binary is ignored
            Ok(_) => {},
            Err(error) => {
                debug!(worker = %worker_id, %error, "worker socket error");
                break;
            },
        }
    }

    send_task.abort();
    broker.worker_disconnected(&worker_id).await;
}

/// Routes one inbound worker frame. Malformed frames and unknown types are
/// dropped; the connection stays open.
async fn dispatch(broker: &Broker, worker_id: &str, text: &str) {
    let msg: WorkerMsg = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(error) => {
            warn!(worker = %worker_id, %error, "dropping malformed worker frame");
            return;
        },
    };

    match msg {
        WorkerMsg::Hello { .. } => debug!(worker = %worker_id, "late hello ignored"),
        WorkerMsg::Answer { job_id, sdp } => {
            broker.worker_answer(worker_id, &job_id, sdp).await
        },
        // the session id some workers echo back adds nothing: jobs are
        // keyed by job id alone
        WorkerMsg::Done { job_id, session_id: _ } => {
            broker.worker_done(worker_id, &job_id).await
        },
        WorkerMsg::Busy { job_id } => broker.worker_busy(worker_id, &job_id).await,
    }
}

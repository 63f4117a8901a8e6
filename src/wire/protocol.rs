use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::job::SdpPayload;

/// A message sent by a worker to the broker.
///
/// Frames that fail to parse into this enum are dropped (with a log line);
/// the connection stays open.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMsg {
    /// Identifies the worker. Must arrive within the handshake timeout of
    /// the connection being accepted, or the broker assigns a random id.
    ///
    /// On the wire: `{"type": "hello", "worker_id": "w-1"}`
    Hello {
        #[serde(default)]
        worker_id: Option<String>,
    },
    /// Carries the SDP answer for a dispatched job. Relayed to the job's
    /// subscribers; the job moves to `answered`.
    ///
    /// On the wire: `{"type": "answer", "job_id": "...", "sdp": "..."}`
    Answer { job_id: String, sdp: String },
    /// Reports a job finished (or torn down after a stop). The job leaves
    /// the registry and the worker's accounting is released.
    ///
    /// On the wire: `{"type": "done", "job_id": "...", "session_id": "..."}`
    Done {
        job_id: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Refuses a dispatched job. The job re-enters the queue at the head.
    ///
    /// On the wire: `{"type": "busy", "job_id": "..."}`
    Busy { job_id: String },
}

/// A command pushed by the broker to a worker socket.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCmd {
    /// Acknowledges the handshake and tells the worker the id the broker
    /// registered it under.
    ///
    /// On the wire: `{"type": "hello_ack", "worker_id": "..."}`
    HelloAck { worker_id: String },
    /// Dispatches a job: the client's SDP offer plus the session snapshot
    /// the worker needs to start processing.
    ///
    /// On the wire: `{"type": "offer", "job_id": ..., "session_id": ...,
    /// "filename": ..., "ammunition": ..., "payload": {"sdp": ..., "type": ...}}`
    Offer {
        job_id: String,
        session_id: String,
        filename: String,
        ammunition: Value,
        payload: SdpPayload,
    },
    /// Asks the worker to tear down a job's processing.
    ///
    /// On the wire: `{"type": "stop", "job_id": "...", "session_id": "..."}`
    Stop { job_id: String, session_id: String },
}

/// An event pushed by the broker to a client subscriber socket.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// The job's 0-based place in the queue, or -1 once it has left it.
    ///
    /// On the wire: `{"type": "queue_position", "position": 0}`
    QueuePosition { position: i64 },
    /// The job was handed to a worker.
    ///
    /// On the wire: `{"type": "assigned", "worker_id": "..."}`
    Assigned { worker_id: String },
    /// The worker's SDP answer for the job.
    ///
    /// On the wire: `{"type": "answer", "sdp": "..."}`
    Answer { sdp: String },
    /// Processing finished.
    ///
    /// On the wire: `{"type": "done"}`
    Done,
    /// Something went wrong with the job or the subscription.
    ///
    /// On the wire: `{"type": "error", "reason": "worker_disconnected"}`
    Error { reason: ErrorReason },
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    /// The worker holding the job vanished; the job is back in the queue.
    WorkerDisconnected,
    /// The subscribed-to job id does not exist.
    UnknownJob,
}

/// Body of `POST /session`.
#[derive(Clone, Debug, Deserialize)]
pub struct CreateSessionReq {
    pub filename: String,
    #[serde(default)]
    pub ammunition: Value,
    /// Caller-supplied session id; a random one is minted when absent.
    #[serde(default)]
    pub custom_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResp {
    pub session_id: String,
    pub filename: String,
}

/// Reply to `POST /session/{sid}/offer`: the minted job id and its 0-based
/// queue position (-1 when it was assigned before the reply was built).
#[derive(Debug, Serialize)]
pub struct OfferResp {
    pub job_id: String,
    pub position: i64,
}

#[derive(Debug, Serialize)]
pub struct VideosResp {
    pub videos: &'static [&'static str],
}

#[derive(Debug, Serialize)]
pub struct HealthResp {
    pub ok: bool,
    pub workers: usize,
    pub queue_length: usize,
    pub jobs_total: usize,
    pub sessions: usize,
    pub videos: &'static [&'static str],
}

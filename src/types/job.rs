use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::session::Session;
use super::states::JobState;

/// An SDP description plus its type tag. The broker never parses the SDP;
/// both fields pass through between clients and workers untouched.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SdpPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// One WebRTC offer/answer round tied to a session, processed by exactly one
/// worker.
///
/// `filename` and `ammunition` are copied out of the session at creation so
/// later session mutation never affects an in-flight job.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub session_id: String,
    pub filename: String,
    pub ammunition: Value,
    pub payload: SdpPayload,
    pub created_at: Instant,
    pub worker_id: Option<String>,
    /// Set while the job is dispatched in the current scheduling cycle.
    pub inflight: bool,
    pub state: JobState,
}

impl Job {
    pub fn new(id: String, session: &Session, payload: SdpPayload) -> Self {
        Self {
            id,
            session_id: session.id.clone(),
            filename: session.filename.clone(),
            ammunition: session.ammunition.clone(),
            payload,
            created_at: Instant::now(),
            worker_id: None,
            inflight: false,
            state: JobState::Queued,
        }
    }

    /// Returns the job to the queued state after a failed or refused
    /// dispatch. The caller is responsible for re-inserting it at the queue
    /// head.
    pub fn requeue(&mut self) {
        self.inflight = false;
        self.worker_id = None;
        self.state = JobState::Queued;
    }
}

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Handle for pushing serialised frames at a connected socket.
///
/// The receiving half is pumped into the WebSocket by the connection's
/// forwarder task, so pushes are ordered per socket and never block. A failed
/// push means the forwarder has exited: the socket is gone.
pub type SocketTx = mpsc::UnboundedSender<String>;

/// A connected GPU worker and its scheduling bookkeeping.
#[derive(Debug)]
pub struct Worker {
    pub id: String,
    pub tx: SocketTx,
    /// The session this worker is bound to, if any. Set when the worker
    /// accepts its first job for a session, cleared when `jobs_count` drops
    /// to zero.
    pub current_session: Option<String>,
    /// Outstanding jobs (assigned, answered, or stopping) held by this
    /// worker.
    pub jobs_count: u32,
    pub connected_at: Instant,
}

impl Worker {
    pub fn new(id: String, tx: SocketTx) -> Self {
        Self {
            id,
            tx,
            current_session: None,
            jobs_count: 0,
            connected_at: Instant::now(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.current_session.is_none()
    }

    /// Releases one outstanding job, unbinding the worker from its session
    /// when none remain.
    pub fn job_finished(&mut self) {
        self.jobs_count = self.jobs_count.saturating_sub(1);
        if self.jobs_count == 0 {
            self.current_session = None;
        }
    }
}

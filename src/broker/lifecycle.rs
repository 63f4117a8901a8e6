use tracing::{debug, info, warn};

use crate::types::states::JobState;
use crate::types::worker::SocketTx;
use crate::wire;
use crate::wire::protocol::WorkerCmd;

use super::Broker;

impl Broker {
    /// Removes a client subscription. When this was the session's last open
    /// client, stop propagation for the whole session is triggered.
    pub async fn client_gone(&self, job_id: &str, session_id: &str, key: u64) {
        let last = {
            let mut st = self.state.lock().await;
            info!(client = key, job = %job_id, session = %session_id, "client disconnected");
            let last = st.unsubscribe(job_id, session_id, key);
            st.log_state("client_exit");
            last
        };

        if last {
            info!(session = %session_id, "last client left, stopping session");
            self.stop_session(session_id).await;
        }
    }

    /// Requests teardown of a single job.
    ///
    /// A job still waiting in the queue is simply removed: no worker ever saw
    /// it, so nobody needs telling. A dispatched job is marked `stopping` and
    /// its worker signalled, best-effort: a failed push is only logged, since
    /// the worker's disconnect handling is the backstop.
    pub async fn stop_job(&self, job_id: &str) {
        let signal: Option<(SocketTx, String)> = {
            let mut st = self.state.lock().await;

            let (state, worker_id, session_id) = match st.jobs.get(job_id) {
                Some(job) => (job.state, job.worker_id.clone(), job.session_id.clone()),
                None => {
                    debug!(job = %job_id, "stop for unknown job");
                    return;
                },
            };

            if state == JobState::Queued && worker_id.is_none() && st.queue.contains(job_id) {
                st.queue.remove(job_id);
                st.jobs.remove(job_id);
                info!(job = %job_id, "removed queued job");
                st.broadcast_positions();
                st.log_state("stop_queued");
                None
            } else if matches!(state, JobState::Stopping | JobState::Done) {
                debug!(job = %job_id, state = %state, "stop skipped");
                None
            } else {
                if let Some(job) = st.jobs.get_mut(job_id) {
                    job.state = JobState::Stopping;
                }
                st.log_state("stop_inflight");
                worker_id
                    .and_then(|wid| st.workers.get(&wid))
                    .map(|w| (w.tx.clone(), session_id))
            }
        };

        if let Some((tx, session_id)) = signal {
            let Some(frame) = wire::encode(&WorkerCmd::Stop {
                job_id: job_id.to_owned(),
                session_id,
            }) else {
                return;
            };
            if tx.send(frame).is_err() {
                warn!(job = %job_id, "stop push failed, disconnect handling will catch it");
            } else {
                info!(job = %job_id, "stop sent to worker");
            }
        }
    }

    /// Requests teardown of every non-terminal job of a session.
    pub async fn stop_session(&self, session_id: &str) {
        let job_ids: Vec<String> = {
            let st = self.state.lock().await;
            st.jobs
                .values()
                .filter(|j| j.session_id == session_id && j.state.is_live())
                .map(|j| j.id.clone())
                .collect()
        };

        for job_id in &job_ids {
            self.stop_job(job_id).await;
        }
    }

    /// Handles a worker socket going away: everything it held is requeued at
    /// the head (subscribers told), positions are rebroadcast, and the
    /// scheduler gets a chance to re-place the work.
    pub async fn worker_disconnected(&self, worker_id: &str) {
        {
            let mut st = self.state.lock().await;
            st.drop_worker(worker_id);
            st.broadcast_positions();
            st.log_state("worker_disconnect");
        }
        self.assign_if_possible().await;
    }
}

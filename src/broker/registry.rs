use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::types::job::Job;
use crate::types::session::Session;
use crate::types::states::JobState;
use crate::types::worker::{SocketTx, Worker};
use crate::wire;
use crate::wire::protocol::{ClientEvent, ErrorReason};

use super::queue::JobQueue;

/// The broker's shared mutable state. Everything here is mutated under one
/// exclusive lock (held by [`Broker`](super::Broker)); socket I/O never
/// happens under that lock. Pushing onto a [`SocketTx`] is not I/O: the
/// per-connection forwarder task does the actual network send.
#[derive(Default)]
pub(super) struct Registry {
    pub(super) sessions: HashMap<String, Session>,
    pub(super) jobs: HashMap<String, Job>,
    pub(super) queue: JobQueue,
    pub(super) workers: HashMap<String, Worker>,
    /// Per job id, the subscribed client handles keyed by connection key.
    subs: HashMap<String, HashMap<u64, SocketTx>>,
    /// Open client sockets per session, across all of its jobs.
    session_clients: HashMap<String, u32>,
}

impl Registry {
    /// Queue position in wire form: 0-based index, or -1 for "not queued"
    /// (assigned jobs and unknown ids alike).
    pub(super) fn wire_position(&self, job_id: &str) -> i64 {
        match self.queue.position(job_id) {
            Some(idx) => idx as i64,
            None => -1,
        }
    }

    /// Delivers an event to every subscriber of `job_id`. Best-effort:
    /// handles whose push fails are pruned, and the subscription set is
    /// dropped once empty.
    pub(super) fn notify_job(&mut self, job_id: &str, event: &ClientEvent) {
        let Some(group) = self.subs.get_mut(job_id) else {
            return;
        };
        let Some(frame) = wire::encode(event) else {
            return;
        };

        group.retain(|_, tx| tx.send(frame.clone()).is_ok());
        if group.is_empty() {
            self.subs.remove(job_id);
        }
    }

    /// Refreshes every queued job's subscribers with its current position.
    pub(super) fn broadcast_positions(&mut self) {
        let entries: Vec<(String, i64)> = self
            .queue
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.to_owned(), idx as i64))
            .collect();

        for (job_id, position) in entries {
            self.notify_job(&job_id, &ClientEvent::QueuePosition { position });
        }
    }

    /// Adds a client handle to a job's subscriber set and bumps the session
    /// reference count.
    pub(super) fn subscribe(
        &mut self,
        job_id: &str,
        session_id: &str,
        key: u64,
        tx: SocketTx,
    ) {
        self.subs.entry(job_id.to_owned()).or_default().insert(key, tx);
        *self.session_clients.entry(session_id.to_owned()).or_insert(0) += 1;
    }

    /// Removes a client handle and drops the session reference. Returns true
    /// when this was the session's last client, in which case the counter is
    /// removed and the caller must trigger stop propagation.
    pub(super) fn unsubscribe(&mut self, job_id: &str, session_id: &str, key: u64) -> bool {
        if let Some(group) = self.subs.get_mut(job_id) {
            group.remove(&key);
            if group.is_empty() {
                self.subs.remove(job_id);
            }
        }

        match self.session_clients.get_mut(session_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.session_clients.remove(session_id);
                    true
                } else {
                    false
                }
            },
            None => false,
        }
    }

    /// Removes a worker and requeues everything it held.
    ///
    /// Live jobs go back to the queue head with an error pushed to their
    /// subscribers. Jobs already `stopping` have nobody left to confirm the
    /// teardown, so they are completed here: dropping them preserves the
    /// invariant that a stored non-queued job names a registered worker.
    pub(super) fn drop_worker(&mut self, worker_id: &str) {
        let Some(worker) = self.workers.remove(worker_id) else {
            return;
        };
        info!(
            worker = %worker_id,
            uptime_s = worker.connected_at.elapsed().as_secs(),
            "worker disconnected"
        );

        let held: Vec<(String, JobState)> = self
            .jobs
            .values()
            .filter(|j| j.worker_id.as_deref() == Some(worker_id))
            .map(|j| (j.id.clone(), j.state))
            .collect();

        for (job_id, state) in held {
            if state.is_live() {
                self.notify_job(
                    &job_id,
                    &ClientEvent::Error {
                        reason: ErrorReason::WorkerDisconnected,
                    },
                );
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.requeue();
                    if !self.queue.contains(&job_id) {
                        self.queue.push_front(job_id);
                    }
                }
            } else if state == JobState::Stopping {
                warn!(job = %job_id, "worker vanished mid-stop, discarding job");
                self.notify_job(&job_id, &ClientEvent::Done);
                self.jobs.remove(&job_id);
            }
        }
    }

    /// Debug snapshot of the whole registry, logged after each mutating
    /// operation group.
    pub(super) fn log_state(&self, whence: &str) {
        debug!(
            whence,
            sessions = self.sessions.len(),
            jobs = self.jobs.len(),
            queue = ?self.queue.iter().collect::<Vec<_>>(),
            workers = self.workers.len(),
            session_clients = ?self.session_clients,
            "state"
        );
    }

    #[cfg(test)]
    pub(super) fn session_client_count(&self, session_id: &str) -> u32 {
        self.session_clients.get(session_id).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(super) fn has_subscribers(&self, job_id: &str) -> bool {
        self.subs.contains_key(job_id)
    }
}

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::types::states::JobState;
use crate::types::worker::SocketTx;
use crate::wire;
use crate::wire::protocol::{ClientEvent, WorkerCmd};

use super::registry::Registry;
use super::Broker;

/// One assignment decision, produced under the lock and acted on outside it.
pub(super) struct Dispatch {
    pub(super) job_id: String,
    pub(super) worker_id: String,
    pub(super) tx: SocketTx,
    pub(super) offer: String,
}

impl Registry {
    /// The locked decision phase of one scheduling step.
    ///
    /// Walks the queue front-to-back without reordering it: stale entries
    /// (unknown, terminal, stopping, or already-inflight jobs) are dropped in
    /// passing, and the first job with an eligible worker is committed to
    /// `assigned`. Jobs the broker cannot place stay exactly where they are,
    /// so FIFO order among waiting jobs is preserved.
    ///
    /// Eligibility: a worker bound to the job's session takes the job only
    /// while idle; a busy bound worker blocks the job rather than letting it
    /// leak to a free worker, which is what keeps one session's jobs
    /// serialised on one worker. Unbound jobs take any free worker.
    pub(super) fn pick_assignment(&mut self) -> Option<Dispatch> {
        if self.workers.is_empty() || self.queue.is_empty() {
            return None;
        }

        let free: Option<String> = self
            .workers
            .values()
            .find(|w| w.is_free())
            .map(|w| w.id.clone());
        let by_session: HashMap<&str, (&str, u32)> = self
            .workers
            .values()
            .filter_map(|w| {
                w.current_session
                    .as_deref()
                    .map(|s| (s, (w.id.as_str(), w.jobs_count)))
            })
            .collect();

        let mut stale: Vec<String> = Vec::new();
        let mut picked: Option<(String, String)> = None;

        for id in self.queue.iter() {
            let Some(job) = self.jobs.get(id) else {
                stale.push(id.to_owned());
                continue;
            };
            if job.inflight || !job.state.is_live() {
                stale.push(id.to_owned());
                continue;
            }

            let choice = match by_session.get(job.session_id.as_str()) {
                // idle worker already bound to this session: affinity wins
                Some((worker_id, 0)) => Some((*worker_id).to_owned()),
                // bound but busy: the job waits for its worker
                Some(_) => None,
                None => free.clone(),
            };

            if let Some(worker_id) = choice {
                picked = Some((id.to_owned(), worker_id));
                break;
            }
        }

        drop(by_session);
        for id in &stale {
            warn!(job = %id, "dropping stale queue entry");
            self.queue.remove(id);
        }

        let (job_id, worker_id) = picked?;

        // Build the offer before committing anything, so an encode failure
        // leaves the registry untouched.
        let (offer, session_id) = {
            let job = self.jobs.get(&job_id)?;
            let offer = wire::encode(&WorkerCmd::Offer {
                job_id: job.id.clone(),
                session_id: job.session_id.clone(),
                filename: job.filename.clone(),
                ammunition: job.ammunition.clone(),
                payload: job.payload.clone(),
            })?;
            (offer, job.session_id.clone())
        };
        let tx = self.workers.get(&worker_id).map(|w| w.tx.clone())?;

        self.queue.remove(&job_id);
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.inflight = true;
            job.state = JobState::Assigned;
            job.worker_id = Some(worker_id.clone());
            debug!(
                job = %job_id,
                worker = %worker_id,
                waited_ms = job.created_at.elapsed().as_millis() as u64,
                "assigning job"
            );
        }
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.jobs_count += 1;
            if worker.current_session.is_none() {
                worker.current_session = Some(session_id);
            }
        }

        Some(Dispatch {
            job_id,
            worker_id,
            tx,
            offer,
        })
    }

    /// Undoes a committed assignment whose offer push failed.
    pub(super) fn rollback_assignment(&mut self, job_id: &str, worker_id: &str) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.job_finished();
        }
        self.requeue_at_head(job_id);
    }

    /// Puts a dispatched job back at the queue head. No-op unless the job is
    /// currently assigned or answered.
    pub(super) fn requeue_at_head(&mut self, job_id: &str) {
        if let Some(job) = self.jobs.get_mut(job_id) {
            if matches!(job.state, JobState::Assigned | JobState::Answered) {
                job.requeue();
                if !self.queue.contains(job_id) {
                    self.queue.push_front(job_id.to_owned());
                }
            }
        }
    }

    /// Clears the session binding of every idle worker, returning whether any
    /// binding was dropped.
    ///
    /// Called between scheduling passes: a binding is kept through a worker's
    /// final `done` so the session's next queued job lands on the same worker,
    /// and released here once no queued job wants it.
    pub(super) fn release_idle_workers(&mut self) -> bool {
        let mut released = false;
        for worker in self.workers.values_mut() {
            if worker.jobs_count == 0 && worker.current_session.take().is_some() {
                debug!(worker = %worker.id, "released idle session binding");
                released = true;
            }
        }
        released
    }
}

impl Broker {
    /// Runs assignment until nothing further can be placed, then refreshes
    /// the remaining subscribers' queue positions.
    ///
    /// Invoked whenever the free-worker set or the queue membership changes:
    /// after enqueue, worker connect, done, busy, and disconnect.
    ///
    /// Each step is a locked decision followed by an unlocked offer push. A
    /// failed push is authoritative proof the worker is gone: the assignment
    /// is rolled back (job to the queue head) and the worker is dropped,
    /// requeueing anything else it held.
    pub async fn assign_if_possible(&self) {
        loop {
            loop {
                let dispatch = self.state.lock().await.pick_assignment();
                let Some(Dispatch {
                    job_id,
                    worker_id,
                    tx,
                    offer,
                }) = dispatch
                else {
                    break;
                };

                if tx.send(offer).is_ok() {
                    let mut st = self.state.lock().await;
                    st.notify_job(
                        &job_id,
                        &ClientEvent::Assigned {
                            worker_id: worker_id.clone(),
                        },
                    );
                    st.notify_job(&job_id, &ClientEvent::QueuePosition { position: -1 });
                    st.log_state("assign");
                } else {
                    warn!(job = %job_id, worker = %worker_id, "offer push failed, rolling back");
                    let mut st = self.state.lock().await;
                    st.rollback_assignment(&job_id, &worker_id);
                    st.drop_worker(&worker_id);
                    st.log_state("assign_rollback");
                }
            }

            // Bindings released here may free a worker for a job that was
            // blocked during the pass, so go around again when one drops.
            if !self.state.lock().await.release_idle_workers() {
                break;
            }
        }

        self.state.lock().await.broadcast_positions();
    }
}

use std::error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::job::{Job, SdpPayload};
use crate::types::session::Session;
use crate::types::states::JobState;
use crate::types::worker::{SocketTx, Worker};
use crate::wire;
use crate::wire::protocol::{
    ClientEvent, CreateSessionReq, CreateSessionResp, HealthResp, OfferResp,
};

mod lifecycle;
mod queue;
mod registry;
mod scheduler;

use registry::Registry;

/// The served video catalogue. Workers hold the same clips on disk.
pub const VIDEOS: &[&str] = &[
    "test_video_1.mp4",
    "test_video_2.mp4",
    "test_video_3.mp4",
    "test_video_4.mp4",
    "test_video_5.mp4",
    "test_video_6.mp4",
    "test_video_7.mp4",
];

/// The queueing, dispatch, and signalling core.
///
/// All shared state lives behind one exclusive lock; see
/// [`Registry`](registry::Registry) for the locking discipline. Everything
/// the HTTP layer needs goes through the methods here; the registry itself
/// is never exposed.
pub struct Broker {
    state: Mutex<Registry>,
    next_client_key: AtomicU64,
}

/// Rejections surfaced to callers of the HTTP endpoints.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BrokerError {
    /// The requested filename is not in the video catalogue.
    UnknownFilename,
    /// No workers are connected, so a session could not do anything.
    NoWorkers,
    /// The referenced session does not exist.
    UnknownSession,
    /// The referenced job does not exist.
    UnknownJob,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use BrokerError::*;

        f.write_str(match self {
            UnknownFilename => "file not found",
            NoWorkers => "no workers connected",
            UnknownSession => "session not found",
            UnknownJob => "job not found",
        })
    }
}

impl error::Error for BrokerError {}

fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Registry::default()),
            next_client_key: AtomicU64::new(1),
        }
    }

    /// Creates a session for one catalogue video and parameter bag.
    ///
    /// Refused when the filename is unknown or when no workers are connected
    /// (a session could never make progress). A caller-supplied `custom_id`
    /// is honoured; otherwise a random id is minted.
    pub async fn create_session(
        &self,
        req: CreateSessionReq,
    ) -> Result<CreateSessionResp, BrokerError> {
        if !VIDEOS.contains(&req.filename.as_str()) {
            return Err(BrokerError::UnknownFilename);
        }

        let mut st = self.state.lock().await;
        if st.workers.is_empty() {
            return Err(BrokerError::NoWorkers);
        }

        let session_id = match req.custom_id {
            Some(id) if !id.is_empty() => id,
            _ => fresh_id(),
        };
        info!(session = %session_id, filename = %req.filename, "session created");
        st.sessions.insert(
            session_id.clone(),
            Session::new(session_id.clone(), req.filename.clone(), req.ammunition),
        );

        Ok(CreateSessionResp {
            session_id,
            filename: req.filename,
        })
    }

    /// Wraps an SDP offer into a job for an existing session and enqueues it.
    ///
    /// The reply carries the job's queue position at reply-building time:
    /// 0-based if it is still waiting, -1 if the scheduler placed it
    /// immediately.
    pub async fn submit_offer(
        &self,
        session_id: &str,
        payload: SdpPayload,
    ) -> Result<OfferResp, BrokerError> {
        let job_id = fresh_id();

        {
            let mut st = self.state.lock().await;
            let job = {
                let session = st
                    .sessions
                    .get_mut(session_id)
                    .ok_or(BrokerError::UnknownSession)?;
                session.touch();
                Job::new(job_id.clone(), session, payload)
            };
            st.jobs.insert(job_id.clone(), job);
            st.queue.push_back(job_id.clone());
            info!(job = %job_id, session = %session_id, "job enqueued");
            st.log_state("enqueue");
            st.broadcast_positions();
        }

        self.assign_if_possible().await;

        let position = self.state.lock().await.wire_position(&job_id);
        Ok(OfferResp { job_id, position })
    }

    /// Registers a worker under its requested id, or a random one. The
    /// caller (the socket handler) is responsible for acknowledging the
    /// handshake and invoking the scheduler afterwards.
    pub async fn register_worker(&self, requested_id: Option<String>, tx: SocketTx) -> String {
        let worker_id = requested_id.unwrap_or_else(fresh_id);

        let mut st = self.state.lock().await;
        info!(worker = %worker_id, "worker connected");
        st.workers
            .insert(worker_id.clone(), Worker::new(worker_id.clone(), tx));
        st.log_state("worker_connect");

        worker_id
    }

    /// Relays a worker's SDP answer to the job's subscribers and moves the
    /// job to `answered`.
    pub async fn worker_answer(&self, worker_id: &str, job_id: &str, sdp: String) {
        debug!(worker = %worker_id, job = %job_id, "answer received");

        let mut st = self.state.lock().await;
        st.notify_job(job_id, &ClientEvent::Answer { sdp });
        if let Some(job) = st.jobs.get_mut(job_id) {
            if job.state == JobState::Assigned {
                job.state = JobState::Answered;
            }
        }
        st.log_state("answer");
    }

    /// Completes a job: subscribers are told, the job leaves the registry,
    /// and the worker's slot opens up for the next candidate.
    pub async fn worker_done(&self, worker_id: &str, job_id: &str) {
        {
            let mut st = self.state.lock().await;
            info!(worker = %worker_id, job = %job_id, "job done");
            st.notify_job(job_id, &ClientEvent::Done);
            st.jobs.remove(job_id);
            if let Some(worker) = st.workers.get_mut(worker_id) {
                // The session binding is kept here so the scheduler can hand
                // this worker the session's next queued job; idle bindings
                // are released at the end of the scheduling pass.
                worker.jobs_count = worker.jobs_count.saturating_sub(1);
            }
            st.log_state("done");
        }

        self.assign_if_possible().await;
    }

    /// Handles a worker refusing a dispatched job: the job goes back to the
    /// queue head and the worker's accounting is released.
    pub async fn worker_busy(&self, worker_id: &str, job_id: &str) {
        {
            let mut st = self.state.lock().await;
            info!(worker = %worker_id, job = %job_id, "worker refused job");
            st.requeue_at_head(job_id);
            if let Some(worker) = st.workers.get_mut(worker_id) {
                worker.job_finished();
            }
            st.log_state("busy");
        }

        self.assign_if_possible().await;
    }

    /// Subscribes a client handle to a job's events and counts it against
    /// the job's session. The current queue position is pushed to the new
    /// subscriber before anything else can be, so position always precedes
    /// assignment in its event stream.
    ///
    /// Returns the connection key and session id the caller must hand back
    /// to [`client_gone`](Broker::client_gone).
    pub async fn subscribe_client(
        &self,
        job_id: &str,
        tx: SocketTx,
    ) -> Result<(u64, String), BrokerError> {
        let key = self.next_client_key.fetch_add(1, Ordering::Relaxed);

        let mut st = self.state.lock().await;
        let session_id = match st.jobs.get(job_id) {
            Some(job) => job.session_id.clone(),
            None => return Err(BrokerError::UnknownJob),
        };

        st.subscribe(job_id, &session_id, key, tx.clone());
        info!(client = key, job = %job_id, session = %session_id, "client subscribed");

        let position = st.wire_position(job_id);
        if let Some(frame) = wire::encode(&ClientEvent::QueuePosition { position }) {
            let _ = tx.send(frame);
        }
        st.log_state("subscribe");

        Ok((key, session_id))
    }

    pub async fn health(&self) -> HealthResp {
        let st = self.state.lock().await;
        HealthResp {
            ok: true,
            workers: st.workers.len(),
            queue_length: st.queue.len(),
            jobs_total: st.jobs.len(),
            sessions: st.sessions.len(),
            videos: VIDEOS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn offer() -> SdpPayload {
        SdpPayload {
            sdp: "v=0 test-offer".into(),
            kind: "offer".into(),
        }
    }

    fn recv_json(rx: &mut UnboundedReceiver<String>) -> Value {
        let frame = rx.try_recv().expect("expected a frame");
        serde_json::from_str(&frame).expect("frame is JSON")
    }

    fn try_recv_json(rx: &mut UnboundedReceiver<String>) -> Option<Value> {
        rx.try_recv()
            .ok()
            .map(|frame| serde_json::from_str(&frame).expect("frame is JSON"))
    }

    /// Drains a socket and returns the `type` tags seen, with positions
    /// rendered as e.g. `queue_position(0)`.
    fn drain_tags(rx: &mut UnboundedReceiver<String>) -> Vec<String> {
        let mut tags = Vec::new();
        while let Some(v) = try_recv_json(rx) {
            let tag = v["type"].as_str().expect("tagged frame").to_owned();
            if tag == "queue_position" {
                tags.push(format!("queue_position({})", v["position"]));
            } else {
                tags.push(tag);
            }
        }
        tags
    }

    async fn connect_worker(broker: &Broker, id: &str) -> UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        broker.register_worker(Some(id.to_owned()), tx).await;
        broker.assign_if_possible().await;
        rx
    }

    async fn create_session(broker: &Broker, id: &str) -> String {
        broker
            .create_session(CreateSessionReq {
                filename: "test_video_1.mp4".into(),
                ammunition: json!({}),
                custom_id: Some(id.to_owned()),
            })
            .await
            .expect("session created")
            .session_id
    }

    async fn subscribe(
        broker: &Broker,
        job_id: &str,
    ) -> (u64, String, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (key, session_id) = broker
            .subscribe_client(job_id, tx)
            .await
            .expect("job exists");
        (key, session_id, rx)
    }

    /// Checks invariants 1-3: worker job accounting matches the jobs map,
    /// every dispatched job names a registered worker bound to its session,
    /// and queue membership mirrors the queued state.
    async fn check_invariants(broker: &Broker) {
        let st = broker.state.lock().await;

        for w in st.workers.values() {
            let held = st
                .jobs
                .values()
                .filter(|j| {
                    j.worker_id.as_deref() == Some(w.id.as_str())
                        && matches!(
                            j.state,
                            JobState::Assigned | JobState::Answered | JobState::Stopping
                        )
                })
                .count() as u32;
            assert_eq!(w.jobs_count, held, "jobs_count drift for worker {}", w.id);
        }

        for j in st.jobs.values() {
            if matches!(
                j.state,
                JobState::Assigned | JobState::Answered | JobState::Stopping
            ) {
                let wid = j.worker_id.as_deref().expect("dispatched job has a worker");
                let w = st.workers.get(wid).expect("worker still registered");
                assert_eq!(
                    w.current_session.as_deref(),
                    Some(j.session_id.as_str()),
                    "affinity broken for job {}",
                    j.id
                );
            }
            assert_eq!(
                st.queue.contains(&j.id),
                j.state == JobState::Queued,
                "queue membership wrong for job {}",
                j.id
            );
        }

        for id in st.queue.iter() {
            assert!(st.jobs.contains_key(id), "dangling queue entry {id}");
        }
    }

    // S1: the full happy path as one client sees it.
    #[tokio::test]
    async fn happy_path_single_client() {
        let broker = Broker::new();

        // session creation needs a connected worker; drop it again so the
        // offer has to wait in the queue
        connect_worker(&broker, "w0").await;
        let sid = create_session(&broker, "s1").await;
        broker.worker_disconnected("w0").await;

        let resp = broker.submit_offer(&sid, offer()).await.unwrap();
        assert_eq!(resp.position, 0);

        let (_key, _sid, mut client) = subscribe(&broker, &resp.job_id).await;
        assert_eq!(
            recv_json(&mut client),
            json!({"type": "queue_position", "position": 0})
        );

        let mut w1 = connect_worker(&broker, "w1").await;
        let got = recv_json(&mut w1);
        assert_eq!(got["type"], "offer");
        assert_eq!(got["job_id"], resp.job_id.as_str());
        assert_eq!(got["payload"]["sdp"], "v=0 test-offer");
        assert_eq!(got["payload"]["type"], "offer");

        assert_eq!(
            recv_json(&mut client),
            json!({"type": "assigned", "worker_id": "w1"})
        );
        assert_eq!(
            recv_json(&mut client),
            json!({"type": "queue_position", "position": -1})
        );

        broker
            .worker_answer("w1", &resp.job_id, "v=0 test-answer".into())
            .await;
        assert_eq!(
            recv_json(&mut client),
            json!({"type": "answer", "sdp": "v=0 test-answer"})
        );

        broker.worker_done("w1", &resp.job_id).await;
        assert_eq!(recv_json(&mut client), json!({"type": "done"}));
        assert!(try_recv_json(&mut client).is_none());

        check_invariants(&broker).await;
        let st = broker.state.lock().await;
        assert!(st.jobs.is_empty());
        assert!(st.queue.is_empty());
        assert_eq!(st.workers["w1"].jobs_count, 0);
        assert!(st.workers["w1"].current_session.is_none());
    }

    // S2: a second job of the same session waits for its worker rather than
    // leaking to a free one.
    #[tokio::test]
    async fn same_session_jobs_serialise_on_one_worker() {
        let broker = Broker::new();
        let mut w1 = connect_worker(&broker, "w1").await;
        let sid = create_session(&broker, "s1").await;

        let a = broker.submit_offer(&sid, offer()).await.unwrap();
        assert_eq!(a.position, -1);
        assert_eq!(recv_json(&mut w1)["job_id"], a.job_id.as_str());

        let b = broker.submit_offer(&sid, offer()).await.unwrap();
        assert_eq!(b.position, 0);

        // a newly-connected free worker must not poach B
        let mut w2 = connect_worker(&broker, "w2").await;
        assert!(try_recv_json(&mut w2).is_none());
        assert_eq!(
            broker.state.lock().await.wire_position(&b.job_id),
            0,
            "B must stay at the queue head"
        );
        check_invariants(&broker).await;

        broker.worker_done("w1", &a.job_id).await;

        // affinity: B lands on W1, not the idle W2
        let got = recv_json(&mut w1);
        assert_eq!(got["job_id"], b.job_id.as_str());
        assert!(try_recv_json(&mut w2).is_none());
        check_invariants(&broker).await;
    }

    // S3: jobs of different sessions fan out across workers.
    #[tokio::test]
    async fn two_sessions_round_robin() {
        let broker = Broker::new();
        let mut w1 = connect_worker(&broker, "w1").await;
        let s1 = create_session(&broker, "s1").await;
        let s2 = create_session(&broker, "s2").await;

        let a = broker.submit_offer(&s1, offer()).await.unwrap();
        assert_eq!(a.position, -1);
        assert_eq!(recv_json(&mut w1)["job_id"], a.job_id.as_str());

        let b = broker.submit_offer(&s2, offer()).await.unwrap();
        assert_eq!(b.position, 0);

        let mut w2 = connect_worker(&broker, "w2").await;
        let got = recv_json(&mut w2);
        assert_eq!(got["job_id"], b.job_id.as_str());
        assert_eq!(got["session_id"], s2.as_str());
        check_invariants(&broker).await;
    }

    // S4: a worker dying mid-flight errors the subscribers, requeues at the
    // head, and the job is redispatched when capacity returns.
    #[tokio::test]
    async fn worker_disconnect_requeues_at_head() {
        let broker = Broker::new();
        let mut w1 = connect_worker(&broker, "w1").await;
        let sid = create_session(&broker, "s1").await;

        let a = broker.submit_offer(&sid, offer()).await.unwrap();
        assert_eq!(recv_json(&mut w1)["job_id"], a.job_id.as_str());

        let (_key, _sid, mut client) = subscribe(&broker, &a.job_id).await;
        assert_eq!(
            drain_tags(&mut client),
            ["queue_position(-1)"],
            "subscriber joined after assignment"
        );

        broker.worker_disconnected("w1").await;
        // the error comes first; the positions rebroadcast (twice: once from
        // the disconnect path, once from the scheduler's trailing refresh)
        // shows the job back at the queue head
        let tags = drain_tags(&mut client);
        assert_eq!(tags[0], "error");
        assert!(tags.len() >= 2);
        assert!(tags[1..].iter().all(|t| t == "queue_position(0)"), "{tags:?}");
        check_invariants(&broker).await;

        let mut w2 = connect_worker(&broker, "w2").await;
        assert_eq!(recv_json(&mut w2)["job_id"], a.job_id.as_str());
        assert_eq!(
            drain_tags(&mut client),
            ["assigned", "queue_position(-1)"]
        );
        check_invariants(&broker).await;
    }

    // S5: last client leaving tears the whole session down: queued jobs
    // vanish silently, in-flight jobs get a stop signal.
    #[tokio::test]
    async fn last_client_leaving_stops_session() {
        let broker = Broker::new();
        let mut w1 = connect_worker(&broker, "w1").await;
        let sid = create_session(&broker, "s1").await;

        let a = broker.submit_offer(&sid, offer()).await.unwrap();
        let q = broker.submit_offer(&sid, offer()).await.unwrap();
        assert_eq!(recv_json(&mut w1)["job_id"], a.job_id.as_str());
        assert_eq!(q.position, 0);

        let (key_a, sid_a, _client_a) = subscribe(&broker, &a.job_id).await;
        let (key_q, sid_q, _client_q) = subscribe(&broker, &q.job_id).await;
        broker
            .worker_answer("w1", &a.job_id, "v=0 test-answer".into())
            .await;

        broker.client_gone(&a.job_id, &sid_a, key_a).await;
        {
            let st = broker.state.lock().await;
            assert_eq!(st.session_client_count(&sid), 1);
            assert!(st.jobs.contains_key(&q.job_id), "one client still holds the session");
        }

        broker.client_gone(&q.job_id, &sid_q, key_q).await;

        let st = broker.state.lock().await;
        assert!(!st.jobs.contains_key(&q.job_id), "queued job removed outright");
        assert!(!st.queue.contains(&q.job_id));
        assert_eq!(st.jobs[&a.job_id].state, JobState::Stopping);
        assert!(!st.has_subscribers(&a.job_id), "emptied subscriber sets are dropped");
        assert!(!st.has_subscribers(&q.job_id));
        assert_eq!(st.session_client_count(&sid), 0);
        drop(st);

        let stop = recv_json(&mut w1);
        assert_eq!(stop["type"], "stop");
        assert_eq!(stop["job_id"], a.job_id.as_str());
        assert_eq!(stop["session_id"], sid.as_str());
        assert!(
            try_recv_json(&mut w1).is_none(),
            "no traffic for the queued job"
        );
        check_invariants(&broker).await;

        // worker confirms the teardown
        broker.worker_done("w1", &a.job_id).await;
        check_invariants(&broker).await;
        let st = broker.state.lock().await;
        assert!(st.jobs.is_empty());
        assert_eq!(st.workers["w1"].jobs_count, 0);
    }

    // S6: busy refusal requeues at the head; another worker picks it up.
    #[tokio::test]
    async fn busy_requeues_and_reassigns() {
        let broker = Broker::new();
        let mut w1 = connect_worker(&broker, "w1").await;
        let mut w2 = connect_worker(&broker, "w2").await;
        let sid = create_session(&broker, "s1").await;

        let a = broker.submit_offer(&sid, offer()).await.unwrap();
        assert_eq!(a.position, -1);

        // free-worker choice is unspecified: find who got it
        let refuser = if try_recv_json(&mut w1).is_some() {
            "w1"
        } else {
            assert!(try_recv_json(&mut w2).is_some());
            "w2"
        };

        broker.worker_busy(refuser, &a.job_id).await;
        check_invariants(&broker).await;

        // the job went out again, to whichever worker was free
        let redispatched = [&mut w1, &mut w2]
            .into_iter()
            .filter_map(try_recv_json)
            .collect::<Vec<_>>();
        assert_eq!(redispatched.len(), 1);
        assert_eq!(redispatched[0]["job_id"], a.job_id.as_str());

        let st = broker.state.lock().await;
        assert_eq!(st.jobs[&a.job_id].state, JobState::Assigned);
    }

    #[tokio::test]
    async fn stop_on_queued_job_is_silent() {
        let broker = Broker::new();
        let mut w1 = connect_worker(&broker, "w1").await;
        let s1 = create_session(&broker, "s1").await;
        let s2 = create_session(&broker, "s2").await;

        // occupy the worker so the second job stays queued
        let a = broker.submit_offer(&s1, offer()).await.unwrap();
        assert_eq!(recv_json(&mut w1)["job_id"], a.job_id.as_str());
        let b = broker.submit_offer(&s2, offer()).await.unwrap();
        assert_eq!(b.position, 0);

        broker.stop_job(&b.job_id).await;

        let st = broker.state.lock().await;
        assert!(!st.jobs.contains_key(&b.job_id));
        assert!(!st.queue.contains(&b.job_id));
        drop(st);
        assert!(try_recv_json(&mut w1).is_none(), "no stop frame for a queued job");
        check_invariants(&broker).await;
    }

    #[tokio::test]
    async fn session_creation_rejections() {
        let broker = Broker::new();

        // no workers yet
        let err = broker
            .create_session(CreateSessionReq {
                filename: "test_video_1.mp4".into(),
                ammunition: json!({}),
                custom_id: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::NoWorkers);

        connect_worker(&broker, "w1").await;

        let err = broker
            .create_session(CreateSessionReq {
                filename: "missing.mp4".into(),
                ammunition: json!({}),
                custom_id: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::UnknownFilename);

        // without a custom id, a random one is minted
        let resp = broker
            .create_session(CreateSessionReq {
                filename: "test_video_2.mp4".into(),
                ammunition: json!({"1": "slug"}),
                custom_id: None,
            })
            .await
            .unwrap();
        assert!(!resp.session_id.is_empty());
        assert_eq!(resp.filename, "test_video_2.mp4");
    }

    #[tokio::test]
    async fn offer_for_unknown_session_is_rejected() {
        let broker = Broker::new();
        assert_eq!(
            broker.submit_offer("nope", offer()).await.unwrap_err(),
            BrokerError::UnknownSession
        );
    }

    #[tokio::test]
    async fn subscribing_to_unknown_job_is_rejected() {
        let broker = Broker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            broker.subscribe_client("nope", tx).await.unwrap_err(),
            BrokerError::UnknownJob
        );
    }

    #[tokio::test]
    async fn job_snapshot_survives_session_mutation() {
        let broker = Broker::new();
        let mut w1 = connect_worker(&broker, "w1").await;
        let sid = create_session(&broker, "s1").await;

        let a = broker.submit_offer(&sid, offer()).await.unwrap();
        assert_eq!(recv_json(&mut w1)["job_id"], a.job_id.as_str());

        // recreating the session under the same id must not touch the
        // in-flight job's snapshot
        broker
            .create_session(CreateSessionReq {
                filename: "test_video_3.mp4".into(),
                ammunition: json!({"7": "ap"}),
                custom_id: Some(sid.clone()),
            })
            .await
            .unwrap();

        let st = broker.state.lock().await;
        assert_eq!(st.jobs[&a.job_id].filename, "test_video_1.mp4");
    }

    // Invariants under a longer scripted churn of the kinds of events the
    // endpoints produce, checked at every quiescent point.
    #[tokio::test]
    async fn invariants_hold_under_churn() {
        let broker = Broker::new();
        let mut w1 = connect_worker(&broker, "w1").await;
        let mut w2 = connect_worker(&broker, "w2").await;
        let s1 = create_session(&broker, "s1").await;
        let s2 = create_session(&broker, "s2").await;
        check_invariants(&broker).await;

        let mut jobs = Vec::new();
        for sid in [&s1, &s2, &s1, &s2, &s1] {
            jobs.push(broker.submit_offer(sid, offer()).await.unwrap().job_id);
            check_invariants(&broker).await;
        }

        // free-worker choice is unspecified, so learn who holds what from
        // the offer frames
        fn drain_offers(
            rx: &mut UnboundedReceiver<String>,
            name: &str,
            held: &mut Vec<(String, String)>,
        ) {
            while let Some(v) = try_recv_json(rx) {
                if v["type"] == "offer" {
                    let job = v["job_id"].as_str().expect("offer frame").to_owned();
                    held.push((job, name.to_owned()));
                }
            }
        }
        let mut held = Vec::new();
        drain_offers(&mut w1, "w1", &mut held);
        drain_offers(&mut w2, "w2", &mut held);
        assert_eq!(held.len(), 2, "one job per session dispatched");

        // the holder of the second job refuses it
        let refuser = held
            .iter()
            .find(|(job, _)| *job == jobs[1])
            .map(|(_, w)| w.clone())
            .expect("second job was dispatched");
        let (key, sub_sid, _client) = subscribe(&broker, &jobs[4]).await;
        check_invariants(&broker).await;

        broker.worker_busy(&refuser, &jobs[1]).await;
        check_invariants(&broker).await;

        broker.worker_disconnected("w2").await;
        check_invariants(&broker).await;

        // whatever w1 now holds, run it to completion
        let mut held = Vec::new();
        drain_offers(&mut w1, "w1", &mut held);
        if let Some((job, _)) = held.first() {
            broker.worker_answer("w1", job, "v=0 a".into()).await;
            check_invariants(&broker).await;
            broker.worker_done("w1", job).await;
            check_invariants(&broker).await;
        }

        broker.client_gone(&jobs[4], &sub_sid, key).await;
        check_invariants(&broker).await;

        broker.worker_disconnected("w1").await;
        check_invariants(&broker).await;
    }
}

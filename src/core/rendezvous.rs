//! FIFO rendezvous pairing submitted jobs with worker capacity.
//!
//! Clients call [`JobRendezvous::submit`] and get back a [`ResponseSlot`] right away.
//! Worker handlers call [`JobRendezvous::take_next`], which parks until a job is queued.
//! A dequeued [`Job`] must be resolved through [`Job::resolve`] or [`Job::fail`].
//! Dropping it unresolved fails the slot with [`TunnelError::UpstreamFailure`], so the
//! waiting client never hangs on a lost job.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` guards the queue; it is never held across an await
//! - `tokio::sync::Notify` wakes parked takers, no polling
//! - Each slot is a `tokio::sync::oneshot` channel, so it resolves at most once

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::core::TunnelError;
use crate::util::clock::now_ms;

/// Identifier assigned to each submitted job.
pub type JobId = u64;

/// Outcome written into a response slot.
pub type JobOutcome<R> = Result<R, TunnelError>;

/// Snapshot of rendezvous throughput counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousStats {
    /// Jobs waiting in the queue.
    pub pending: usize,
    /// Total jobs submitted.
    pub submitted: u64,
    /// Total jobs handed to a worker handler.
    pub dispatched: u64,
    /// Jobs resolved with a response.
    pub resolved: u64,
    /// Jobs resolved with a failure.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct RendezvousCounters {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    resolved: AtomicU64,
    failed: AtomicU64,
}

/// One pending unit of work: a request plus the slot its response goes into.
pub struct Job<Req, Resp> {
    id: JobId,
    created_at_ms: u128,
    request: Req,
    responder: Option<oneshot::Sender<JobOutcome<Resp>>>,
    counters: Arc<RendezvousCounters>,
}

impl<Req, Resp> Job<Req, Resp> {
    /// Job identifier.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Submission time in milliseconds since epoch.
    #[must_use]
    pub const fn created_at_ms(&self) -> u128 {
        self.created_at_ms
    }

    /// The request payload.
    #[must_use]
    pub const fn request(&self) -> &Req {
        &self.request
    }

    /// Whether the client side has stopped waiting for this job.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.responder
            .as_ref()
            .is_none_or(oneshot::Sender::is_closed)
    }

    /// Resolve the slot with a response. Returns `false` if the client already left.
    pub fn resolve(mut self, response: Resp) -> bool {
        self.finish(Ok(response))
    }

    /// Resolve the slot with a failure. Returns `false` if the client already left.
    pub fn fail(mut self, err: TunnelError) -> bool {
        self.finish(Err(err))
    }

    /// Resolve the slot with either outcome.
    pub fn complete(mut self, outcome: JobOutcome<Resp>) -> bool {
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: JobOutcome<Resp>) -> bool {
        let Some(tx) = self.responder.take() else {
            return false;
        };
        if outcome.is_ok() {
            self.counters.resolved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        let delivered = tx.send(outcome).is_ok();
        if !delivered {
            debug!(job_id = self.id, "client stopped waiting; outcome discarded");
        }
        delivered
    }
}

impl<Req, Resp> Drop for Job<Req, Resp> {
    fn drop(&mut self) {
        if self.responder.is_some() {
            warn!(job_id = self.id, "job dropped unresolved; failing its slot");
            self.finish(Err(TunnelError::UpstreamFailure(
                "job abandoned before a response was produced".into(),
            )));
        }
    }
}

impl<Req, Resp> fmt::Debug for Job<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("created_at_ms", &self.created_at_ms)
            .field("resolved", &self.responder.is_none())
            .finish_non_exhaustive()
    }
}

/// Client-side handle to a job's eventual outcome.
#[derive(Debug)]
pub struct ResponseSlot<Resp> {
    id: JobId,
    rx: oneshot::Receiver<JobOutcome<Resp>>,
}

impl<Resp> ResponseSlot<Resp> {
    /// Identifier of the job backing this slot.
    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Wait until the job is resolved.
    ///
    /// # Errors
    ///
    /// Returns the failure the job was resolved with, typically
    /// [`TunnelError::UpstreamFailure`].
    pub async fn wait(self) -> JobOutcome<Resp> {
        self.rx.await.unwrap_or_else(|_| {
            Err(TunnelError::UpstreamFailure(
                "response slot closed without an outcome".into(),
            ))
        })
    }

    /// Take the outcome if the job has already been resolved, without waiting.
    ///
    /// Returns `None` while the job is pending. The outcome is handed out once; later
    /// calls report the slot as closed.
    pub fn try_take(&mut self) -> Option<JobOutcome<Resp>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(TunnelError::UpstreamFailure(
                "response slot closed without an outcome".into(),
            ))),
        }
    }

    /// Wait until the job is resolved or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Timeout`] when the deadline passes first, otherwise as [`Self::wait`].
    pub async fn wait_timeout(self, timeout: Duration) -> JobOutcome<Resp> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .unwrap_or(Err(TunnelError::Timeout(timeout)))
    }
}

/// Thread- and task-safe FIFO queue pairing requests with response slots.
pub struct JobRendezvous<Req, Resp> {
    queue: Mutex<VecDeque<Job<Req, Resp>>>,
    available: Notify,
    counters: Arc<RendezvousCounters>,
    next_id: AtomicU64,
}

impl<Req, Resp> Default for JobRendezvous<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> JobRendezvous<Req, Resp> {
    /// Create an empty rendezvous.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            counters: Arc::new(RendezvousCounters::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Enqueue a request at the tail and return its response slot without blocking.
    pub fn submit(&self, request: Req) -> ResponseSlot<Resp> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let job = Job {
            id,
            created_at_ms: now_ms(),
            request,
            responder: Some(tx),
            counters: Arc::clone(&self.counters),
        };

        let depth = {
            let mut queue = self.queue.lock();
            queue.push_back(job);
            queue.len()
        };
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();

        debug!(job_id = id, depth, "job submitted");
        ResponseSlot { id, rx }
    }

    /// Pop the oldest queued job, if any.
    pub fn try_take_next(&self) -> Option<Job<Req, Resp>> {
        let job = self.queue.lock().pop_front()?;
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = job.id, "job dispatched");
        Some(job)
    }

    /// Wait for the oldest queued job and take it.
    ///
    /// Cancel-safe: a caller dropped while parked has taken nothing.
    pub async fn take_next(&self) -> Job<Req, Resp> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent submit cannot slip between.
            notified.as_mut().enable();

            if let Some(job) = self.try_take_next() {
                return job;
            }
            notified.await;
        }
    }

    /// Number of jobs waiting in the queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Snapshot of queue depth and throughput counters.
    #[must_use]
    pub fn stats(&self) -> RendezvousStats {
        RendezvousStats {
            pending: self.pending(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

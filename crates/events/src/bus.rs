//! In-process progress bus backed by one `tokio::sync::broadcast` channel
//! per job.
//!
//! [`ProgressBus`] is designed to be shared via `Arc<ProgressBus>` between
//! the job service, the orchestrator tasks and the WebSocket handlers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::Stream;
use stemsplit_core::error::CoreError;
use stemsplit_core::progress::{EventKind, EventPayload, ProgressEvent};
use stemsplit_core::types::JobId;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Default per-subscriber buffer. When full, the oldest undelivered events
/// are dropped for that subscriber only.
pub const DEFAULT_CAPACITY: usize = 256;

/// How many closed topics are remembered for publish-after-terminal detection.
const CLOSED_TOPIC_MEMORY: usize = 4096;

// ---------------------------------------------------------------------------
// ProgressBus
// ---------------------------------------------------------------------------

struct Topic {
    sender: broadcast::Sender<ProgressEvent>,
    next_sequence: u64,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<JobId, Topic>,
    closed: HashSet<JobId>,
    closed_order: VecDeque<JobId>,
}

impl BusState {
    fn remember_closed(&mut self, job_id: JobId) {
        if self.closed.insert(job_id) {
            self.closed_order.push_back(job_id);
        }
        while self.closed_order.len() > CLOSED_TOPIC_MEMORY {
            if let Some(old) = self.closed_order.pop_front() {
                self.closed.remove(&old);
            }
        }
    }
}

/// Per-job fan-out event bus.
///
/// Publishing never blocks: each subscriber owns a bounded buffer inside
/// the broadcast channel. Sequence numbers are assigned under the bus lock,
/// so every subscriber of a job observes one total order.
pub struct ProgressBus {
    state: Mutex<BusState>,
    capacity: usize,
}

impl ProgressBus {
    /// Create a bus whose topics buffer `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the topic for a newly created job. Re-opening is a no-op.
    pub fn open(&self, job_id: JobId) {
        let mut state = self.lock();
        if state.closed.contains(&job_id) {
            tracing::warn!(job_id = %job_id, "Refusing to reopen a closed progress topic");
            return;
        }
        state.topics.entry(job_id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.capacity);
            Topic {
                sender,
                next_sequence: 1,
            }
        });
    }

    /// Publish an event on a job's topic and return its sequence number.
    ///
    /// Events without subscribers are dropped (no replay). A terminal kind
    /// closes the topic: current subscribers drain what is buffered and
    /// then end. Publishing after the terminal event is a programming error;
    /// it asserts in debug builds and is logged and ignored otherwise.
    pub fn publish(&self, job_id: JobId, kind: EventKind, payload: EventPayload) -> Option<u64> {
        let mut state = self.lock();

        if state.closed.contains(&job_id) {
            tracing::error!(
                job_id = %job_id,
                kind = kind.wire_name(),
                "Event published after the terminal event",
            );
            debug_assert!(false, "event published after terminal event for job {job_id}");
            return None;
        }

        let Some(topic) = state.topics.get_mut(&job_id) else {
            tracing::warn!(job_id = %job_id, kind = kind.wire_name(), "Publish to unknown topic");
            return None;
        };

        let sequence = topic.next_sequence;
        topic.next_sequence += 1;

        let event = ProgressEvent {
            job_id,
            sequence,
            kind,
            payload,
            timestamp: chrono::Utc::now(),
        };
        // A SendError only means there are zero receivers.
        let _ = topic.sender.send(event);

        if kind.is_terminal() {
            // Dropping the sender lets receivers drain and then observe `Closed`.
            state.topics.remove(&job_id);
            state.remember_closed(job_id);
            tracing::debug!(job_id = %job_id, sequence, "Progress topic closed");
        }

        Some(sequence)
    }

    /// Subscribe to every event published on the job's topic from now on.
    ///
    /// Fails with `NotFound` for unknown jobs and jobs whose terminal event
    /// has already been published.
    pub fn subscribe(&self, job_id: JobId) -> Result<Subscription, CoreError> {
        let state = self.lock();
        let topic = state
            .topics
            .get(&job_id)
            .ok_or(CoreError::NotFound(job_id))?;

        Ok(Subscription {
            job_id,
            receiver: topic.sender.subscribe(),
            finished: false,
            missed: 0,
        })
    }

    /// Number of live subscribers on a job's topic.
    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.lock()
            .topics
            .get(&job_id)
            .map(|t| t.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Whether the topic exists and has not been closed.
    pub fn is_open(&self, job_id: JobId) -> bool {
        self.lock().topics.contains_key(&job_id)
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// One subscriber's cursor on a job's topic.
///
/// Ends after yielding the terminal event, or when the topic closes.
#[derive(Debug)]
pub struct Subscription {
    job_id: JobId,
    receiver: broadcast::Receiver<ProgressEvent>,
    finished: bool,
    missed: u64,
}

impl Subscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Events dropped for this subscriber because it fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Receive the next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    self.missed += skipped;
                    tracing::warn!(
                        job_id = %self.job_id,
                        skipped,
                        "Slow progress subscriber dropped oldest events",
                    );
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Leave the topic. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {
        tracing::debug!(job_id = %self.job_id, "Progress subscriber left");
    }

    /// Adapt into a `Stream` of events.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Progress Reporter: structured events from a run to any number of consumers.
//!
//! Events go into a bounded ring. [`ProgressReporter::emit`] never waits: when
//! the ring is full the oldest event is dropped. Every [`Subscription`] keeps
//! its own cursor; a subscriber that falls behind the ring skips ahead to the
//! oldest retained event and can see how many it missed.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::trace;

use crate::backup::task::TaskStage;
use crate::catalog::ObjectId;

pub const DEFAULT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    Run,
    Task(ObjectId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Stage { stage: TaskStage },
    /// `percent` is `None` when the object's size is unknown.
    Progress { percent: Option<u8>, bytes: u64 },
    Completed { path: Option<PathBuf>, bytes: u64 },
    Failed { reason: String },
    Cancelled,
    Log { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub scope: EventScope,
    pub kind: EventKind,
}

impl ProgressEvent {
    pub fn object_id(&self) -> Option<&ObjectId> {
        match &self.scope {
            EventScope::Task(id) => Some(id),
            EventScope::Run => None,
        }
    }
}

struct Ring {
    events: VecDeque<ProgressEvent>,
    next_seq: u64,
    closed: bool,
}

struct Shared {
    ring: Mutex<Ring>,
    notify: Notify,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct ProgressReporter {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl ProgressReporter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                ring: Mutex::new(Ring {
                    events: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER)),
                    next_seq: 0,
                    closed: false,
                }),
                notify: Notify::new(),
                capacity,
            }),
        }
    }

    pub fn emit(&self, scope: EventScope, kind: EventKind) {
        {
            let mut ring = self.shared.lock();
            if ring.closed {
                return;
            }
            let event = ProgressEvent {
                seq: ring.next_seq,
                at: Utc::now(),
                scope,
                kind,
            };
            trace!(seq = event.seq, scope = ?event.scope, kind = ?event.kind, "progress event");
            ring.next_seq += 1;
            ring.events.push_back(event);
            while ring.events.len() > self.shared.capacity {
                ring.events.pop_front();
            }
        }
        self.shared.notify.notify_waiters();
    }

    pub fn task(&self, id: &ObjectId, kind: EventKind) {
        self.emit(EventScope::Task(id.clone()), kind);
    }

    pub fn run(&self, kind: EventKind) {
        self.emit(EventScope::Run, kind);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.run(EventKind::Log {
            message: message.into(),
        });
    }

    /// No more events will be emitted; subscribers end after draining.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// New cursor positioned at the oldest retained event.
    pub fn subscribe(&self) -> Subscription {
        let ring = self.shared.lock();
        let cursor = ring.events.front().map(|e| e.seq).unwrap_or(ring.next_seq);
        Subscription {
            shared: Arc::clone(&self.shared),
            cursor,
            missed: 0,
        }
    }
}

pub struct Subscription {
    shared: Arc<Shared>,
    cursor: u64,
    missed: u64,
}

enum Poll {
    Ready(ProgressEvent),
    Closed,
    Pending,
}

impl Subscription {
    fn poll_ring(&mut self) -> Poll {
        let ring = self.shared.lock();
        if let Some(front) = ring.events.front() {
            if self.cursor < front.seq {
                self.missed += front.seq - self.cursor;
                self.cursor = front.seq;
            }
            let offset = (self.cursor - front.seq) as usize;
            if let Some(event) = ring.events.get(offset) {
                self.cursor += 1;
                return Poll::Ready(event.clone());
            }
        }
        if ring.closed { Poll::Closed } else { Poll::Pending }
    }

    /// Next event, or `None` once the reporter is closed and drained.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        let shared = Arc::clone(&self.shared);
        loop {
            // Registered before the ring is checked so a concurrent emit
            // cannot slip between the check and the wait.
            let notified = shared.notify.notified();
            match self.poll_ring() {
                Poll::Ready(event) => return Some(event),
                Poll::Closed => return None,
                Poll::Pending => notified.await,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::next`].
    pub fn try_next(&mut self) -> Option<ProgressEvent> {
        match self.poll_ring() {
            Poll::Ready(event) => Some(event),
            _ => None,
        }
    }

    /// Events dropped by the ring before this subscriber could read them.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

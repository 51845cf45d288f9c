//! Bounded inbound queue shared by every connector.
//!
//! Fan-in is multi-producer, single-consumer: listeners push, the supervisor
//! pops. Pushes block while the queue is full; a connector that keeps
//! overflowing earns the right to shed the oldest non-message event instead,
//! so messages are preferred to keep under pressure.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use courier_core::{Error, Event, EventKind, Result};

pub const DEFAULT_CAPACITY: usize = 1024;

/// Full-queue pushes a connector must absorb before it may shed.
pub const SHED_THRESHOLD: u64 = 16;

#[derive(Debug)]
struct QueueInner {
    events: VecDeque<Event>,
    overflow: HashMap<String, u64>,
    closed: bool,
}

#[derive(Debug)]
pub struct InboundQueue {
    inner: Mutex<QueueInner>,
    not_full: Notify,
    not_empty: Notify,
    capacity: usize,
    shed_after: u64,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, SHED_THRESHOLD)
    }

    pub fn with_limits(capacity: usize, shed_after: u64) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                events: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                overflow: HashMap::new(),
                closed: false,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            capacity,
            shed_after,
        }
    }

    /// Enqueues `event` on behalf of `connector`, waiting for space while the
    /// queue is full. Once the connector's overflow count passes the shedding
    /// threshold, a full queue sheds its oldest non-message event instead of
    /// blocking; when only messages remain the push keeps waiting.
    pub async fn push(&self, connector: &str, event: Event) -> Result<()> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(Error::Transport("Inbound queue is closed".to_string()));
                }
                if inner.events.len() < self.capacity {
                    inner.events.push_back(event);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                let count = {
                    let entry = inner.overflow.entry(connector.to_string()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if count > self.shed_after {
                    let victim = inner
                        .events
                        .iter()
                        .position(|e| e.kind() != EventKind::Message);
                    if let Some(pos) = victim {
                        if let Some(dropped) = inner.events.remove(pos) {
                            warn!(
                                connector = %connector,
                                dropped = %dropped.kind(),
                                overflow = count,
                                "Inbound queue full, shed oldest non-message event"
                            );
                        }
                        inner.events.push_back(event);
                        self.not_empty.notify_one();
                        return Ok(());
                    }
                }
                debug!(connector = %connector, overflow = count, "Inbound queue full, waiting");
            }
            notified.await;
        }
    }

    /// Dequeues the oldest event. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<Event> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().await;
                if let Some(event) = inner.events.pop_front() {
                    self.not_full.notify_one();
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops accepting pushes and wakes every waiter. Queued events stay
    /// poppable until [`clear`](Self::clear).
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Discards everything still queued and reports how many events were lost.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let dropped = inner.events.len();
        inner.events.clear();
        dropped
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Full-queue pushes seen from `connector` so far.
    pub async fn overflow_count(&self, connector: &str) -> u64 {
        self.inner
            .lock()
            .await
            .overflow
            .get(connector)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connector handle a listener pushes through. Applies the connector's
/// capability gate before anything reaches the shared queue.
#[derive(Clone)]
pub struct EventSink {
    connector: String,
    capabilities: Vec<EventKind>,
    queue: std::sync::Arc<InboundQueue>,
}

impl EventSink {
    pub fn new(connector: &str, capabilities: &[EventKind], queue: std::sync::Arc<InboundQueue>) -> Self {
        Self {
            connector: connector.to_string(),
            capabilities: capabilities.to_vec(),
            queue,
        }
    }

    pub async fn push(&self, event: Event) -> Result<()> {
        if !self.capabilities.contains(&event.kind()) {
            warn!(
                connector = %self.connector,
                kind = %event.kind(),
                "Connector cannot carry this event kind, dropping"
            );
            return Ok(());
        }
        self.queue.push(&self.connector, event).await
    }
}

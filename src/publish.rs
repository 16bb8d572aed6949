use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::PublishError;
use crate::frame::EncodedFrame;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Frames buffered per subscriber before new frames are dropped for it.
    pub queue_depth: usize,
    /// A subscriber that accepts nothing for this long is disconnected.
    pub stall_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_depth: 2,
            stall_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: usize,
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<EncodedFrame>,
    last_accepted: Instant,
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<SubscriberSlot>,
    latest: Option<EncodedFrame>,
    last_sequence: Option<u64>,
    next_id: u64,
    closed: bool,
}

/// Fans encoded frames out to live preview subscribers.
///
/// Publishing never waits: a subscriber with a full queue misses the frame,
/// every other subscriber still gets it.
#[derive(Clone)]
pub struct PreviewPublisher {
    inner: Arc<Mutex<Inner>>,
    config: PublisherConfig,
}

impl Default for PreviewPublisher {
    fn default() -> Self {
        Self::new(PublisherConfig::default())
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PreviewPublisher {
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            inner: Default::default(),
            config,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.closed {
            // sender dropped right away, the subscription ends immediately
            return Subscription {
                id,
                rx,
                publisher: Weak::new(),
            };
        }
        if let Some(latest) = &inner.latest {
            // fresh channel, cannot be full
            let _ = tx.try_send(latest.clone());
        }
        inner.subscribers.push(SubscriberSlot {
            id,
            tx,
            last_accepted: Instant::now(),
        });
        tracing::info!("Preview subscriber {} attached", id);
        Subscription {
            id,
            rx,
            publisher: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        remove_subscriber(&self.inner, id);
    }

    /// Disconnect every subscriber and refuse new ones. Open preview
    /// streams end, which lets the HTTP server shut down.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        inner.closed = true;
        let dropped = inner.subscribers.len();
        inner.subscribers.clear();
        tracing::info!("Preview publisher closed, {} subscribers disconnected", dropped);
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    /// Most recently published frame.
    pub fn latest(&self) -> Option<EncodedFrame> {
        lock(&self.inner).latest.clone()
    }

    pub fn publish(&self, frame: EncodedFrame) -> Result<PublishReport, PublishError> {
        let mut inner = lock(&self.inner);
        if let Some(last) = inner.last_sequence {
            if frame.sequence <= last {
                return Err(PublishError::OutOfOrder {
                    sequence: frame.sequence,
                    last,
                });
            }
        }
        inner.last_sequence = Some(frame.sequence);

        let now = Instant::now();
        let stall_timeout = self.config.stall_timeout;
        let mut report = PublishReport::default();
        inner.subscribers.retain_mut(|slot| match slot.tx.try_send(frame.clone()) {
            Ok(()) => {
                slot.last_accepted = now;
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                let stalled = now.duration_since(slot.last_accepted);
                if stalled > stall_timeout {
                    let err = PublishError::Stalled {
                        id: slot.id,
                        stalled_ms: stalled.as_millis(),
                    };
                    tracing::warn!("Dropping preview subscriber: {}", err);
                    report.evicted += 1;
                    false
                } else {
                    report.dropped += 1;
                    true
                }
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("{}", PublishError::Disconnected(slot.id));
                report.evicted += 1;
                false
            }
        });
        inner.latest = Some(frame);
        Ok(report)
    }
}

fn remove_subscriber(inner: &Mutex<Inner>, id: u64) {
    let mut inner = lock(inner);
    let before = inner.subscribers.len();
    inner.subscribers.retain(|slot| slot.id != id);
    if inner.subscribers.len() != before {
        tracing::info!("Preview subscriber {} detached", id);
    }
}

/// Receiving end of a preview subscription. Detaches itself on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<EncodedFrame>,
    publisher: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `None` once the publisher dropped this subscriber.
    pub async fn recv(&mut self) -> Option<EncodedFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<EncodedFrame> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.publisher.upgrade() {
            remove_subscriber(&inner, self.id);
        }
    }
}

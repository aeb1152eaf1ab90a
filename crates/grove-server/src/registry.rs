use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use grove_core::ids::ChannelId;
use grove_telemetry::{names, MetricsRecorder};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

/// Why a message could not be handed to a channel.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("channel closed")]
    Closed,
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// Server side of one client connection. Outbound text goes through a
/// bounded FIFO drained by the channel's writer task.
pub struct Channel {
    id: ChannelId,
    tx: mpsc::Sender<String>,
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl Channel {
    /// A fresh channel in `Connecting` state plus the receiving end of its
    /// outbound queue.
    pub fn new(queue_size: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let channel = Arc::new(Self {
            id: ChannelId::new(),
            tx,
            state: AtomicU8::new(ChannelState::Connecting as u8),
            shutdown: CancellationToken::new(),
        });
        (channel, rx)
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn mark_open(&self) {
        let _ = self.state.compare_exchange(
            ChannelState::Connecting as u8,
            ChannelState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Mark the channel closed and wake its reader and writer.
    pub fn close(&self) {
        self.state.store(ChannelState::Closed as u8, Ordering::Release);
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Resolves once [`Channel::close`] has been called.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Enqueue one serialized message, waiting at most `timeout` for room.
    pub async fn deliver(&self, text: String, timeout: Duration) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.tx.send_timeout(text, timeout).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => DeliveryError::Timeout(timeout),
            SendTimeoutError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Every open channel, keyed by its id.
pub struct ChannelRegistry {
    channels: DashMap<ChannelId, Arc<Channel>>,
    metrics: Arc<MetricsRecorder>,
}

impl ChannelRegistry {
    pub fn new(metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            channels: DashMap::new(),
            metrics,
        }
    }

    /// Mark the channel open and add it. Returns `false` if it was already
    /// registered or has been closed; neither is inserted.
    pub fn register(&self, channel: Arc<Channel>) -> bool {
        if channel.is_closed() {
            return false;
        }
        channel.mark_open();
        let inserted = match self.channels.entry(channel.id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(channel);
                true
            }
        };
        if inserted {
            self.metrics.counter_inc(names::WS_CONNECTIONS_TOTAL, &[], 1);
            self.publish_count();
        }
        inserted
    }

    /// Remove and close the channel. Absent ids are a no-op returning `false`.
    pub fn unregister(&self, id: &ChannelId) -> bool {
        match self.channels.remove(id) {
            Some((_, channel)) => {
                channel.close();
                self.publish_count();
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.channels.len()
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.contains_key(id)
    }

    /// Current members. Later (un)registrations do not affect the returned list.
    pub fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|entry| entry.value().clone()).collect()
    }

    fn publish_count(&self) {
        self.metrics
            .gauge_set(names::WS_ACTIVE_CONNECTIONS, &[], self.count() as i64);
    }
}

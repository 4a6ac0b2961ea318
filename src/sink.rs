//! Downstream hand-off of received station data.
//!
//! The receiver never persists anything itself. Each unique data frame becomes a
//! [`RawStationDataFrame`] and is handed to a [`RawFrameSink`]. Between the session
//! receive loop and the sink sits a bounded [`ForwardQueue`] so a slow consumer can
//! only cost dropped payloads, never a stalled socket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::warn;

use crate::types::JulianTimestamp;
use crate::{Cd11Error, Result};

/// One data frame as received from a station, ready for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStationDataFrame {
    pub station: String,
    pub sequence_number: u64,
    /// `SITE.CHAN[.LOC]` per channel subframe.
    pub channel_ids: Vec<String>,
    pub payload_start: JulianTimestamp,
    pub payload_end: JulianTimestamp,
    pub reception_time: JulianTimestamp,
    /// The complete frame exactly as it arrived, checksum included.
    pub raw: Bytes,
}

/// Consumer of received data frames.
///
/// Implementations are shared by every session, so `store` takes `&self`.
#[async_trait::async_trait]
pub trait RawFrameSink: Send + Sync + 'static {
    /// Accept one frame. An error is logged by the caller and the frame is lost.
    async fn store(&self, frame: RawStationDataFrame) -> Result<()>;
}

/// Sink that forwards frames into a tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<RawStationDataFrame>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RawStationDataFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl RawFrameSink for ChannelSink {
    async fn store(&self, frame: RawStationDataFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Cd11Error::Sink { reason: "channel receiver dropped".to_string() })
    }
}

/// What happened to a pushed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue stayed full past the blocking window; the oldest item was evicted.
    DroppedOldest,
    Closed,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded single-producer single-consumer queue with drop-oldest overflow.
#[derive(Debug)]
pub struct ForwardQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    block_for: Duration,
    item_ready: Notify,
    space_ready: Notify,
    dropped: AtomicU64,
}

impl<T> ForwardQueue<T> {
    pub fn new(capacity: usize, block_for: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState { items: VecDeque::with_capacity(capacity), closed: false }),
            capacity,
            block_for,
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue, waiting up to the blocking window for space before evicting.
    pub async fn push(&self, item: T) -> PushOutcome {
        let deadline = tokio::time::Instant::now() + self.block_for;
        let mut item = Some(item);

        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return PushOutcome::Closed;
                }
                if state.items.len() < self.capacity {
                    if let Some(item) = item.take() {
                        state.items.push_back(item);
                    }
                    drop(state);
                    self.item_ready.notify_one();
                    return PushOutcome::Queued;
                }
            }

            if tokio::time::timeout_at(deadline, self.space_ready.notified()).await.is_err() {
                break;
            }
        }

        let mut state = self.state.lock();
        if state.closed {
            return PushOutcome::Closed;
        }
        let outcome = if state.items.len() >= self.capacity {
            state.items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            PushOutcome::DroppedOldest
        } else {
            PushOutcome::Queued
        };
        if let Some(item) = item.take() {
            state.items.push_back(item);
        }
        drop(state);
        self.item_ready.notify_one();
        outcome
    }

    /// Dequeue, waiting for an item. `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.space_ready.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.item_ready.notified().await;
        }
    }

    /// Stop accepting items. Queued items remain poppable.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.item_ready.notify_one();
        self.space_ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Log an eviction as an alert condition for monitoring.
pub(crate) fn report_backpressure(station: &str, sequence_number: u64, dropped_total: u64) {
    warn!(
        station,
        seq = sequence_number,
        dropped_total,
        alert = true,
        "downstream consumer is not keeping up, dropped oldest queued payload"
    );
}

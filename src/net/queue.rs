//! Per-connection queues between the transport and the tick loop
//!
//! Built on crossbeam-channel. Each queue has exactly one producer and one
//! consumer. Bounded queues never block the producer: when full, the oldest
//! item is evicted so a slow consumer only loses its own stale data.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError, TrySendError};

use crate::error::SyncError;
use crate::game::command::CommandBatch;
use crate::game::Tick;
use crate::net::protocol::ServerMessage;

#[derive(Debug, Default)]
struct Shared {
    producer_closed: AtomicBool,
    consumer_closed: AtomicBool,
    dropped: AtomicU64,
}

/// Producer half
pub struct QueueSender<T> {
    sender: Sender<T>,
    /// Consumer clone used to evict the oldest item of a full bounded queue
    evict: Option<Receiver<T>>,
    shared: Arc<Shared>,
}

/// Consumer half
pub struct QueueReceiver<T> {
    receiver: Receiver<T>,
    shared: Arc<Shared>,
}

/// Queue of at most `capacity` items, dropping the oldest when full
pub fn drop_oldest<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (sender, receiver) = bounded(capacity.max(1));
    let shared = Arc::new(Shared::default());
    (
        QueueSender {
            sender,
            evict: Some(receiver.clone()),
            shared: shared.clone(),
        },
        QueueReceiver { receiver, shared },
    )
}

/// Queue without a bound, for traffic that must not be lost
pub fn lossless<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let (sender, receiver) = unbounded();
    let shared = Arc::new(Shared::default());
    (
        QueueSender {
            sender,
            evict: None,
            shared: shared.clone(),
        },
        QueueReceiver { receiver, shared },
    )
}

impl<T> QueueSender<T> {
    /// Enqueue without blocking
    ///
    /// Returns `Ok(true)` when an older item was evicted to make room.
    pub fn push(&self, mut item: T) -> Result<bool, SyncError> {
        if self.shared.consumer_closed.load(Ordering::Acquire) {
            return Err(SyncError::QueueClosed);
        }

        let mut evicted = false;
        loop {
            match self.sender.try_send(item) {
                Ok(()) => return Ok(evicted),
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if let Some(evict) = &self.evict {
                        if evict.try_recv().is_ok() {
                            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                            evicted = true;
                        }
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Err(SyncError::QueueClosed),
            }
        }
    }

    /// Items waiting for the consumer
    #[inline]
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    /// Consumer side is gone
    pub fn is_closed(&self) -> bool {
        self.shared.consumer_closed.load(Ordering::Acquire)
    }

    /// Items evicted so far
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for QueueSender<T> {
    fn drop(&mut self) {
        self.shared.producer_closed.store(true, Ordering::Release);
    }
}

impl<T> QueueReceiver<T> {
    /// Drain every pending item
    pub fn drain(&self) -> Vec<T> {
        self.receiver.try_iter().collect()
    }

    pub fn try_pop(&self) -> Option<T> {
        match self.receiver.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Producer is gone and nothing is left to drain
    pub fn is_closed(&self) -> bool {
        self.shared.producer_closed.load(Ordering::Acquire) && self.receiver.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for QueueReceiver<T> {
    fn drop(&mut self) {
        self.shared.consumer_closed.store(true, Ordering::Release);
    }
}

// ============================================================================
// Queue payloads
// ============================================================================

/// Transport -> tick loop, per connection
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Commands(CommandBatch),
    /// The client acknowledged the snapshot of this tick
    Acked(Tick),
    /// Latest round-trip estimate of the session
    Rtt(Duration),
    /// The client said goodbye or its session failed
    Disconnected(String),
    /// Nothing was received for the configured silence interval
    TimedOut,
}

/// Encoded snapshot frame waiting for the unreliable channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSnapshot {
    pub tick: Tick,
    pub frame: Vec<u8>,
}

/// Reliable delivery progress published by the transport
///
/// Holds how many reliable messages the transport has taken off the queue
/// (wrapping) and how many of those the client has not acknowledged yet.
/// Both live in one word so a reader never sees one without the other.
#[derive(Debug, Clone, Default)]
pub struct ReliableProgress(Arc<AtomicU64>);

impl ReliableProgress {
    pub fn publish(&self, taken: u32, unacked: u32) {
        self.0
            .store((u64::from(taken) << 32) | u64::from(unacked), Ordering::Release);
    }

    /// `(taken, unacked)`
    pub fn load(&self) -> (u32, u32) {
        let word = self.0.load(Ordering::Acquire);
        ((word >> 32) as u32, word as u32)
    }
}

/// Tick-loop ends of one connection's queues
pub struct LoopQueues {
    pub inbound: QueueReceiver<Inbound>,
    pub reliable: QueueSender<ServerMessage>,
    pub snapshots: QueueSender<OutboundSnapshot>,
    pub progress: ReliableProgress,
}

/// Transport ends of one connection's queues
pub struct TransportQueues {
    pub inbound: QueueSender<Inbound>,
    pub reliable: QueueReceiver<ServerMessage>,
    pub snapshots: QueueReceiver<OutboundSnapshot>,
    pub progress: ReliableProgress,
}

/// Create the three queues of one connection
pub fn connection_queues(
    command_capacity: usize,
    snapshot_capacity: usize,
) -> (LoopQueues, TransportQueues) {
    let (inbound_tx, inbound_rx) = drop_oldest(command_capacity);
    let (reliable_tx, reliable_rx) = lossless();
    let (snapshot_tx, snapshot_rx) = drop_oldest(snapshot_capacity);
    let progress = ReliableProgress::default();
    (
        LoopQueues {
            inbound: inbound_rx,
            reliable: reliable_tx,
            snapshots: snapshot_tx,
            progress: progress.clone(),
        },
        TransportQueues {
            inbound: inbound_tx,
            reliable: reliable_rx,
            snapshots: snapshot_rx,
            progress,
        },
    )
}

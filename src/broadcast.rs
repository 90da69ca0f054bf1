//! One-to-many event fan-out.
//!
//! Every observer gets its own bounded queue. Publishing never blocks: a full
//! queue drops the event for that observer only, and a disconnected observer
//! is removed on the next publish.

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::detect::PlateDetection;
use crate::registry::PlateRecord;

pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Rendered frame payload: base64 JPEG under `image`.
#[derive(Clone, Debug, Serialize)]
pub struct FrameImage {
    pub image: String,
}

/// Events pushed to observers.
#[derive(Clone, Debug)]
pub enum BroadcastEvent {
    /// Full registry snapshot.
    PlatesList(Vec<PlateRecord>),
    /// Rendered frame, once per pipeline cycle.
    Frame(FrameImage),
    /// Fresh plate accepted this cycle.
    PlateDetected(PlateDetection),
}

impl BroadcastEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            BroadcastEvent::PlatesList(_) => "plates_list",
            BroadcastEvent::Frame(_) => "frame",
            BroadcastEvent::PlateDetected(_) => "plate_detected",
        }
    }

    /// JSON payload of the event.
    pub fn data_json(&self) -> Result<String> {
        let json = match self {
            BroadcastEvent::PlatesList(records) => serde_json::to_string(records)?,
            BroadcastEvent::Frame(frame) => serde_json::to_string(frame)?,
            BroadcastEvent::PlateDetected(detection) => serde_json::to_string(detection)?,
        };
        Ok(json)
    }
}

/// Cloneable publisher handle.
#[derive(Clone, Debug)]
pub struct Broadcaster {
    subscribers: Arc<Mutex<Vec<Sender<Arc<BroadcastEvent>>>>>,
    queue_depth: usize,
}

impl Broadcaster {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = bounded(self.queue_depth);
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        Subscription { rx }
    }

    /// Deliver `event` to every observer with room in its queue.
    ///
    /// Returns the number of observers that received it.
    pub fn publish(&self, event: BroadcastEvent) -> usize {
        let event = Arc::new(event);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        let mut delivered = 0;
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::debug!("broadcast: observer queue full, dropped {}", event.name());
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

/// Receiving end for one observer. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: Receiver<Arc<BroadcastEvent>>,
}

impl Subscription {
    /// Wait up to `timeout` for the next event.
    ///
    /// `None` on timeout or when the broadcaster is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<BroadcastEvent>> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<Arc<BroadcastEvent>> {
        self.rx.try_recv().ok()
    }

    /// Events currently queued.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

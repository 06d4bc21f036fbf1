//! Event ingestion pipeline.
//!
//! Background readers push `(source, payload)` items into one unbounded queue and never
//! look at what they carry. The state machine owns the single consumer and drains the
//! whole queue on a fixed period, handing items over strictly in arrival order: a lick
//! that arrived before a door acknowledgement is always processed first.
//!
//! ```text
//! motor reader ──┐
//!                ├──▶ EventSender ──▶ [unbounded mpsc] ──▶ EventQueue::drain ──▶ state machine
//! laser reader ──┘
//! ```

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::hardware::LinkId;

/// What a reader decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// One complete, trimmed line
    Line(String),
    /// The reader stopped; no more items will come from this source
    Disconnected(String),
}

/// One queued item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestItem {
    /// Link the item was read from
    pub source: LinkId,
    /// Decoded content
    pub payload: Payload,
    /// When the reader finished decoding it
    pub received_at: Instant,
}

/// Producer side, cloned into every reader.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<IngestItem>,
}

impl EventSender {
    /// Enqueue an item stamped with the current time. Never blocks.
    ///
    /// Returns `false` once the consumer is gone, which tells a reader to stop.
    pub fn push(&self, source: LinkId, payload: Payload) -> bool {
        self.tx
            .send(IngestItem {
                source,
                payload,
                received_at: Instant::now(),
            })
            .is_ok()
    }
}

/// Consumer side, owned by the state machine.
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<IngestItem>,
}

impl EventQueue {
    /// Create a connected sender/queue pair.
    pub fn new() -> (EventSender, EventQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender { tx }, EventQueue { rx })
    }

    /// Take everything queued right now, oldest first.
    pub fn drain(&mut self) -> Vec<IngestItem> {
        let mut items = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }
}

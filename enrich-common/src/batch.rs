//! # Batch accumulation
//!
//! Buffers events until the size or age threshold is reached, or until upstream ends.
use std::time;

use tokio::time::Instant;
use tracing::debug;

use crate::event::{Batch, Event};
use crate::metrics_consts::{BATCHES_RELEASED, BATCH_SIZE, FORCED_SMALL_BATCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// A threshold was reached, the caller should release the batch.
    BatchReady,
    Buffering,
}

#[derive(Debug)]
pub struct BatchAccumulator {
    max_size: usize,
    max_wait: Option<time::Duration>,
    events: Vec<Event>,
    /// When the oldest buffered event arrived.
    started_at: Option<Instant>,
}

impl BatchAccumulator {
    pub fn new(max_size: usize, max_wait: Option<time::Duration>) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            max_wait,
            events: Vec::with_capacity(max_size),
            started_at: None,
        }
    }

    pub fn accept(&mut self, event: Event) -> Accepted {
        if self.events.is_empty() {
            self.started_at = Some(Instant::now());
        }
        self.events.push(event);

        if self.is_ready() {
            Accepted::BatchReady
        } else {
            Accepted::Buffering
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.max_size
    }

    /// The instant the buffered events become due, if there is a time bound and anything buffered.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.started_at, self.max_wait) {
            (Some(started_at), Some(max_wait)) => Some(started_at + max_wait),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        if self.events.is_empty() {
            return false;
        }
        self.is_full() || self.deadline().is_some_and(|d| Instant::now() >= d)
    }

    /// Release the buffered events if a threshold was reached.
    pub fn take_ready(&mut self) -> Option<Batch> {
        if !self.is_ready() {
            return None;
        }
        if !self.is_full() {
            metrics::counter!(FORCED_SMALL_BATCH).increment(1);
        }
        Some(self.release())
    }

    /// Release whatever is buffered, regardless of thresholds. Used when upstream ends.
    pub fn flush(&mut self) -> Batch {
        self.release()
    }

    fn release(&mut self) -> Batch {
        self.started_at = None;
        let events = std::mem::replace(&mut self.events, Vec::with_capacity(self.max_size));

        if !events.is_empty() {
            metrics::counter!(BATCHES_RELEASED).increment(1);
            metrics::histogram!(BATCH_SIZE).record(events.len() as f64);
            debug!(size = events.len(), "releasing batch");
        }
        Batch::new(events)
    }
}

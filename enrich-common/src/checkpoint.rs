//! # Checkpoint
//!
//! The store trait the upstream collaborator implements, and the coordinator deciding when
//! the engine may ask it to advance.
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::CheckpointError;
use crate::metrics_consts::{CHECKPOINT_ADVANCED, CHECKPOINT_POSITION};

/// Durable upstream read position. Both calls must be idempotent under replay.
#[async_trait]
pub trait CheckpointStore: Send {
    /// Persist that every event up to and including `position` is done.
    async fn advance(&mut self, position: u64) -> Result<(), CheckpointError>;

    /// Flush and close the store. Called once, at stream end or after a fatal error.
    async fn finish(&mut self) -> Result<(), CheckpointError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Accumulating,
    /// A released batch is being enriched and flushed. Events for the next batch may already
    /// be buffering.
    Flushing,
    Finished,
}

/// Tracks the batch cycle and advances the store only once a batch is fully emitted and the
/// sink acknowledged its flush.
#[derive(Debug)]
pub struct CheckpointCoordinator<C> {
    store: C,
    state: CoordinatorState,
    /// Position the batch being flushed will advance to.
    pending: Option<u64>,
    position: Option<u64>,
}

impl<C: CheckpointStore> CheckpointCoordinator<C> {
    pub fn new(store: C) -> Self {
        Self {
            store,
            state: CoordinatorState::Idle,
            pending: None,
            position: None,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// The last position the store was asked to advance to.
    pub fn position(&self) -> Option<u64> {
        self.position
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    pub fn on_buffered(&mut self) {
        if self.state == CoordinatorState::Idle {
            self.state = CoordinatorState::Accumulating;
        }
    }

    pub fn begin_flush(&mut self, last_eid: u64) {
        if self.state == CoordinatorState::Finished {
            warn!(last_eid, "batch released after checkpoint finished");
            return;
        }
        self.pending = Some(last_eid);
        self.state = CoordinatorState::Flushing;
    }

    /// The batch in flight was emitted and flushed: advance to its last event.
    pub async fn complete_flush(&mut self, has_buffered: bool) -> Result<(), CheckpointError> {
        if let Some(target) = self.pending.take() {
            if self.position.map_or(true, |position| target > position) {
                self.store.advance(target).await?;
                self.position = Some(target);

                metrics::counter!(CHECKPOINT_ADVANCED).increment(1);
                metrics::gauge!(CHECKPOINT_POSITION).set(target as f64);
                debug!(position = target, "advanced checkpoint");
            }
        }

        if self.state != CoordinatorState::Finished {
            self.state = if has_buffered {
                CoordinatorState::Accumulating
            } else {
                CoordinatorState::Idle
            };
        }
        Ok(())
    }

    /// Drop the batch in flight without advancing.
    pub fn abort(&mut self) {
        if let Some(last_eid) = self.pending.take() {
            warn!(
                last_eid,
                position = self.position,
                "aborting batch, checkpoint not advanced"
            );
        }
        if self.state != CoordinatorState::Finished {
            self.state = CoordinatorState::Idle;
        }
    }

    /// Terminal call. A batch still pending at this point is dropped, not advanced.
    pub async fn finish(&mut self) -> Result<(), CheckpointError> {
        if self.state == CoordinatorState::Finished {
            return Ok(());
        }
        self.abort();
        self.state = CoordinatorState::Finished;
        self.store.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        advanced: Vec<u64>,
        finished: u32,
    }

    #[async_trait]
    impl CheckpointStore for Recorder {
        async fn advance(&mut self, position: u64) -> Result<(), CheckpointError> {
            self.advanced.push(position);
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), CheckpointError> {
            self.finished += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cycle_advances_after_flush() {
        let mut coordinator = CheckpointCoordinator::new(Recorder::default());
        assert_eq!(coordinator.state(), CoordinatorState::Idle);

        coordinator.on_buffered();
        assert_eq!(coordinator.state(), CoordinatorState::Accumulating);

        coordinator.begin_flush(4);
        assert_eq!(coordinator.state(), CoordinatorState::Flushing);
        assert!(coordinator.store().advanced.is_empty());

        coordinator.complete_flush(false).await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
        assert_eq!(coordinator.position(), Some(4));
        assert_eq!(coordinator.store().advanced, vec![4]);
    }

    #[tokio::test]
    async fn test_overlapping_accumulation_returns_to_accumulating() {
        let mut coordinator = CheckpointCoordinator::new(Recorder::default());
        coordinator.on_buffered();
        coordinator.begin_flush(1);
        coordinator.on_buffered();
        assert_eq!(coordinator.state(), CoordinatorState::Flushing);

        coordinator.complete_flush(true).await.unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Accumulating);
    }

    #[tokio::test]
    async fn test_abort_does_not_advance() {
        let mut coordinator = CheckpointCoordinator::new(Recorder::default());
        coordinator.begin_flush(2);
        coordinator.complete_flush(false).await.unwrap();

        coordinator.begin_flush(9);
        coordinator.abort();
        coordinator.complete_flush(false).await.unwrap();
        coordinator.finish().await.unwrap();

        assert_eq!(coordinator.store().advanced, vec![2]);
        assert_eq!(coordinator.position(), Some(2));
        assert_eq!(coordinator.store().finished, 1);
    }

    #[tokio::test]
    async fn test_position_never_moves_backwards() {
        let mut coordinator = CheckpointCoordinator::new(Recorder::default());
        coordinator.begin_flush(10);
        coordinator.complete_flush(false).await.unwrap();
        coordinator.begin_flush(7);
        coordinator.complete_flush(false).await.unwrap();

        assert_eq!(coordinator.store().advanced, vec![10]);
        assert_eq!(coordinator.position(), Some(10));
    }

    #[tokio::test]
    async fn test_finish_is_called_once() {
        let mut coordinator = CheckpointCoordinator::new(Recorder::default());
        coordinator.finish().await.unwrap();
        coordinator.finish().await.unwrap();
        coordinator.begin_flush(3);

        assert_eq!(coordinator.state(), CoordinatorState::Finished);
        assert_eq!(coordinator.store().finished, 1);
    }
}

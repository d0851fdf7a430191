//! # Ordered emission
//!
//! Results land in a fixed slot array indexed by each event's position in its batch. A cursor
//! walks the array and hands every contiguous resolved slot to the sink, stopping at the first
//! gap, so downstream sees input order no matter in which order results complete.
use tracing::debug;

use crate::error::{EngineError, SlotError};
use crate::event::AssembledOutput;
use crate::metrics_consts::{OUTPUTS_EMITTED, OUTPUTS_SKIPPED, SINK_BACKPRESSURE};
use crate::sink::Sink;

#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Pending,
    Ready(AssembledOutput),
    /// The event produces no output, but the cursor may move past it.
    Skipped,
    /// Already handed downstream.
    Released,
}

#[derive(Debug)]
pub struct OutputSlots {
    slots: Vec<Slot>,
    next: usize,
}

impl OutputSlots {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Slot::Pending).collect(),
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Resolve a pending slot. Each slot resolves exactly once.
    pub fn fill(&mut self, index: usize, slot: Slot) -> Result<(), SlotError> {
        let len = self.slots.len();
        let current = self
            .slots
            .get_mut(index)
            .ok_or(SlotError::OutOfRange { index, len })?;

        if *current != Slot::Pending || matches!(slot, Slot::Pending | Slot::Released) {
            return Err(SlotError::AlreadyFilled(index));
        }
        *current = slot;
        Ok(())
    }

    /// Take the slot under the cursor if it is resolved, and move the cursor past it.
    pub fn next_ready(&mut self) -> Option<Slot> {
        let slot = self.slots.get_mut(self.next)?;
        if *slot == Slot::Pending {
            return None;
        }
        self.next += 1;
        Some(std::mem::replace(slot, Slot::Released))
    }

    /// `None` until the first slot has been released.
    pub fn last_emitted_index(&self) -> Option<usize> {
        self.next.checked_sub(1)
    }

    pub fn is_complete(&self) -> bool {
        self.next == self.slots.len()
    }

    /// Slots the cursor has not moved past yet.
    pub fn unresolved(&self) -> usize {
        self.slots.len() - self.next
    }
}

/// Counts for one emitted batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmitSummary {
    pub emitted: usize,
    pub skipped: usize,
}

/// Writes a batch's outputs to the sink in input order as their slots resolve.
pub struct OrderedEmitter<'a> {
    slots: OutputSlots,
    sink: &'a mut (dyn Sink + 'a),
    summary: EmitSummary,
}

impl<'a> OrderedEmitter<'a> {
    pub fn new(sink: &'a mut (dyn Sink + 'a), len: usize) -> Self {
        Self {
            slots: OutputSlots::new(len),
            sink,
            summary: EmitSummary::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn last_emitted_index(&self) -> Option<usize> {
        self.slots.last_emitted_index()
    }

    pub async fn emit(&mut self, index: usize, output: AssembledOutput) -> Result<(), EngineError> {
        self.fill(index, Slot::Ready(output)).await
    }

    pub async fn skip(&mut self, index: usize) -> Result<(), EngineError> {
        self.fill(index, Slot::Skipped).await
    }

    /// Resolve a slot, then write everything contiguous from the cursor on. Suspends while the
    /// sink signals it is at capacity.
    pub async fn fill(&mut self, index: usize, slot: Slot) -> Result<(), EngineError> {
        self.slots.fill(index, slot)?;

        while let Some(slot) = self.slots.next_ready() {
            match slot {
                Slot::Ready(output) => {
                    if !self.sink.write(output).await? {
                        metrics::counter!(SINK_BACKPRESSURE).increment(1);
                        debug!("sink at capacity, waiting");
                        self.sink.ready().await?;
                    }
                    metrics::counter!(OUTPUTS_EMITTED).increment(1);
                    self.summary.emitted += 1;
                }
                Slot::Skipped => {
                    metrics::counter!(OUTPUTS_SKIPPED).increment(1);
                    self.summary.skipped += 1;
                }
                Slot::Pending | Slot::Released => {}
            }
        }
        Ok(())
    }

    /// Every slot must have been released by now.
    pub fn finish(self) -> Result<EmitSummary, EngineError> {
        if !self.slots.is_complete() {
            return Err(EngineError::IncompleteBatch {
                unresolved: self.slots.unresolved(),
                total: self.slots.len(),
            });
        }
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::test_utils::RecordingSink;
    use serde_json::json;

    fn output(eid: u64) -> AssembledOutput {
        AssembledOutput::pass_through(Event::new(eid, json!({ "n": eid })))
    }

    #[test]
    fn test_cursor_stops_at_gaps() {
        let mut slots = OutputSlots::new(3);
        assert_eq!(slots.last_emitted_index(), None);

        slots.fill(1, Slot::Ready(output(1))).unwrap();
        assert_eq!(slots.next_ready(), None);

        slots.fill(0, Slot::Skipped).unwrap();
        assert_eq!(slots.next_ready(), Some(Slot::Skipped));
        assert_eq!(slots.next_ready(), Some(Slot::Ready(output(1))));
        assert_eq!(slots.next_ready(), None);
        assert_eq!(slots.last_emitted_index(), Some(1));
        assert_eq!(slots.unresolved(), 1);
        assert!(!slots.is_complete());
    }

    #[test]
    fn test_slots_resolve_once() {
        let mut slots = OutputSlots::new(2);
        slots.fill(0, Slot::Skipped).unwrap();

        assert_eq!(
            slots.fill(0, Slot::Ready(output(0))),
            Err(SlotError::AlreadyFilled(0))
        );
        assert_eq!(
            slots.fill(2, Slot::Skipped),
            Err(SlotError::OutOfRange { index: 2, len: 2 })
        );
        assert_eq!(slots.fill(1, Slot::Pending), Err(SlotError::AlreadyFilled(1)));
    }

    #[tokio::test]
    async fn test_emits_in_input_order() {
        let mut sink = RecordingSink::new();
        let handle = sink.handle();
        let mut emitter = OrderedEmitter::new(&mut sink, 4);

        emitter.emit(2, output(2)).await.unwrap();
        emitter.emit(3, output(3)).await.unwrap();
        assert!(handle.written().is_empty());

        emitter.emit(0, output(0)).await.unwrap();
        assert_eq!(handle.written_eids(), vec![0]);
        assert_eq!(emitter.last_emitted_index(), Some(0));

        emitter.skip(1).await.unwrap();
        assert_eq!(handle.written_eids(), vec![0, 2, 3]);

        let summary = emitter.finish().unwrap();
        assert_eq!(summary, EmitSummary { emitted: 3, skipped: 1 });
    }

    #[tokio::test]
    async fn test_unresolved_slots_fail_the_batch() {
        let mut sink = RecordingSink::new();
        let mut emitter = OrderedEmitter::new(&mut sink, 3);
        emitter.emit(0, output(0)).await.unwrap();

        match emitter.finish() {
            Err(EngineError::IncompleteBatch { unresolved, total }) => {
                assert_eq!(unresolved, 2);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_waits_for_sink_capacity() {
        let mut sink = RecordingSink::with_capacity(1);
        let handle = sink.handle();
        let mut emitter = OrderedEmitter::new(&mut sink, 3);

        for index in 0..3 {
            emitter.emit(index, output(index as u64)).await.unwrap();
        }
        emitter.finish().unwrap();

        assert_eq!(handle.written_eids(), vec![0, 1, 2]);
        assert_eq!(handle.max_pending(), 1);
        assert_eq!(handle.backpressure_waits(), 3);
    }
}

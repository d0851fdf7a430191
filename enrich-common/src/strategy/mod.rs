//! The external-operation strategies an enrichment pipeline can run.
//!
//! Both are driven the same way: the pipeline hands a released batch and an emitter sized to
//! it, and the strategy fills one slot per event, in any order.
use async_trait::async_trait;

use crate::emitter::OrderedEmitter;
use crate::error::EngineError;
use crate::event::Batch;

pub mod join_fetch;
pub mod retry_call;

pub use join_fetch::{
    EntityDefinition, IndirectLookup, JoinFetch, KeyClassConfig, MergeStrategy, Row, RowSource,
    SubQuery,
};
pub use retry_call::{OnOperationFailure, RemoteCall, RetryCall};

#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the pipeline may buffer the next batch while this one is still in flight.
    fn overlaps_accumulation(&self) -> bool {
        false
    }

    /// Resolve every slot of `emitter`, one per event of `batch` in batch order. An error
    /// aborts the batch.
    async fn enrich(&self, batch: Batch, emitter: &mut OrderedEmitter<'_>)
        -> Result<(), EngineError>;
}

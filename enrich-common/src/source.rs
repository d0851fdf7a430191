use async_trait::async_trait;

use crate::error::SourceError;
use crate::event::Event;

/// The upstream reader, yielding events in order with increasing `eid`s.
///
/// Where reading starts is the source's business: implementations resume from the last
/// position advanced through their checkpoint store, so a restart redelivers everything
/// after it.
#[async_trait]
pub trait EventSource: Send {
    /// The next event, or `None` once upstream has ended.
    ///
    /// Must be cancel safe: the pipeline races this against batch deadlines and in-flight
    /// work, and dropping the future before it resolves must not lose an event.
    async fn next_event(&mut self) -> Option<Result<Event, SourceError>>;
}

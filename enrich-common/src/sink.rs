use async_trait::async_trait;

use crate::error::SinkError;
use crate::event::AssembledOutput;

/// The downstream writer. Outputs are written strictly in input order.
#[async_trait]
pub trait Sink: Send {
    /// Hand one output to the sink. `Ok(false)` means the sink is at capacity and the caller
    /// must wait on `ready` before writing again.
    async fn write(&mut self, output: AssembledOutput) -> Result<bool, SinkError>;

    /// Resolves once the sink can take more writes.
    async fn ready(&mut self) -> Result<(), SinkError>;

    /// Resolves once every output written so far is durably acknowledged downstream.
    async fn flush(&mut self) -> Result<(), SinkError>;
}

//! # Retry-call
//!
//! One remote call per event, each under its own bounded retry loop. Calls complete in any
//! order; each result is written to its event's slot as it lands. A call that exhausts its
//! retries only affects its own event, unless the failure policy escalates it.
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::emitter::{OrderedEmitter, Slot};
use crate::error::{EngineError, OperationError, OperationFailed};
use crate::event::{AssembledOutput, Batch, Event};
use crate::executor::BoundedExecutor;
use crate::metrics_consts::{OPERATIONS_FAILED, OPERATION_DURATION};
use crate::retry::{retry_operation, RetryPolicy};
use crate::strategy::Enricher;

/// A single request/response exchange for one event's payload.
#[async_trait]
pub trait RemoteCall: Send + Sync {
    async fn call(&self, event: &Event) -> Result<Value, OperationError>;
}

/// What happens to an event whose call failed for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnOperationFailure {
    /// Log it and leave the event out of the output.
    #[default]
    Skip,
    /// Emit the original event without enrichment.
    PassThrough,
    /// Fail the batch.
    Abort,
}

impl FromStr for OnOperationFailure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(OnOperationFailure::Skip),
            "pass-through" | "pass_through" | "passthrough" => Ok(OnOperationFailure::PassThrough),
            "abort" => Ok(OnOperationFailure::Abort),
            invalid => Err(format!("{invalid} is not a valid operation failure policy")),
        }
    }
}

pub struct RetryCall {
    remote: Arc<dyn RemoteCall>,
    policy: RetryPolicy,
    executor: BoundedExecutor,
    on_failure: OnOperationFailure,
}

impl RetryCall {
    pub fn new(
        remote: Arc<dyn RemoteCall>,
        policy: RetryPolicy,
        concurrency_limit: usize,
        on_failure: OnOperationFailure,
    ) -> Self {
        Self {
            remote,
            policy,
            executor: BoundedExecutor::new(concurrency_limit),
            on_failure,
        }
    }

    /// What the event's slot resolves to once its call is over.
    fn resolve(
        &self,
        event: &Event,
        result: Result<Value, OperationFailed>,
    ) -> Result<Slot, EngineError> {
        let failed = match result {
            Ok(response) => {
                return Ok(Slot::Ready(AssembledOutput::enriched(event.clone(), response)))
            }
            Err(failed) => failed,
        };

        metrics::counter!(OPERATIONS_FAILED).increment(1);
        match self.on_failure {
            OnOperationFailure::Skip => {
                warn!(eid = event.eid, "skipping event: {}", failed);
                Ok(Slot::Skipped)
            }
            OnOperationFailure::PassThrough => {
                warn!(eid = event.eid, "passing event through: {}", failed);
                Ok(Slot::Ready(AssembledOutput::pass_through(event.clone())))
            }
            OnOperationFailure::Abort => Err(failed.into()),
        }
    }
}

#[async_trait]
impl Enricher for RetryCall {
    fn name(&self) -> &'static str {
        "retry_call"
    }

    fn overlaps_accumulation(&self) -> bool {
        true
    }

    #[instrument(skip_all, fields(size = batch.len()))]
    async fn enrich(
        &self,
        batch: Batch,
        emitter: &mut OrderedEmitter<'_>,
    ) -> Result<(), EngineError> {
        let events = batch.into_events();

        let calls: Vec<_> = events
            .iter()
            .enumerate()
            .map(|(index, event)| async move {
                let start = time::Instant::now();
                let result =
                    retry_operation(&self.policy, event.eid, || self.remote.call(event)).await;
                metrics::histogram!(OPERATION_DURATION).record(start.elapsed().as_secs_f64());
                (index, result)
            })
            .collect();
        let completions = self.executor.stream(calls);
        tokio::pin!(completions);

        // Completions that landed while the sink was applying backpressure.
        let mut landed = VecDeque::new();
        let mut drained = false;

        loop {
            let next = match landed.pop_front() {
                Some(completion) => Some(completion),
                None if drained => None,
                None => completions.next().await,
            };
            let Some((index, result)) = next else {
                break;
            };

            let slot = self.resolve(&events[index], result)?;
            let fill = emitter.fill(index, slot);
            tokio::pin!(fill);
            // Keep the remaining calls moving while the emitter waits on the sink.
            loop {
                tokio::select! {
                    biased;
                    filled = &mut fill => break filled?,
                    completion = completions.next(), if !drained => match completion {
                        Some(completion) => landed.push_back(completion),
                        None => drained = true,
                    },
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::EmitSummary;
    use crate::test_utils::{RecordingSink, ScriptedCall};
    use serde_json::json;

    fn batch(len: u64) -> Batch {
        Batch::new((0..len).map(|eid| Event::new(eid, json!({ "n": eid }))).collect())
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    async fn run(
        strategy: &RetryCall,
        batch: Batch,
    ) -> (Result<EmitSummary, EngineError>, Vec<AssembledOutput>) {
        let mut sink = RecordingSink::new();
        let handle = sink.handle();
        let mut emitter = OrderedEmitter::new(&mut sink, batch.len());
        let result = match strategy.enrich(batch, &mut emitter).await {
            Ok(()) => emitter.finish(),
            Err(e) => Err(e),
        };
        (result, handle.written())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_twice_then_succeed() {
        let remote = Arc::new(ScriptedCall::new().fail_times(1, 2));
        let strategy = RetryCall::new(remote.clone(), policy(), 10, OnOperationFailure::Skip);
        let start = tokio::time::Instant::now();

        let (result, written) = run(&strategy, batch(3)).await;

        assert_eq!(result.unwrap(), EmitSummary { emitted: 3, skipped: 0 });
        let eids: Vec<u64> = written.iter().map(|o| o.eid()).collect();
        assert_eq!(eids, vec![0, 1, 2]);
        assert_eq!(written[1].enrichment, Some(json!({ "echo": { "n": 1 } })));

        let calls = remote.calls_for(1);
        assert_eq!(calls.len(), 3);
        let first_backoff = calls[1] - calls[0];
        let second_backoff = calls[2] - calls[1];
        assert_eq!(first_backoff, time::Duration::from_secs(2));
        assert_eq!(second_backoff, time::Duration::from_secs(4));
        assert_eq!(start.elapsed(), time::Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_completions_are_emitted_in_order() {
        let remote = Arc::new(
            ScriptedCall::new()
                .delay(0, time::Duration::from_millis(30))
                .delay(1, time::Duration::from_millis(10))
                .delay(2, time::Duration::from_millis(20)),
        );
        let strategy = RetryCall::new(remote, policy(), 10, OnOperationFailure::Skip);

        let (result, written) = run(&strategy, batch(4)).await;

        result.unwrap();
        let eids: Vec<u64> = written.iter().map(|o| o.eid()).collect();
        assert_eq!(eids, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_event_is_skipped_without_blocking_siblings() {
        let remote = Arc::new(ScriptedCall::new().fail_times(1, 10));
        let strategy = RetryCall::new(remote.clone(), policy(), 10, OnOperationFailure::Skip);

        let (result, written) = run(&strategy, batch(3)).await;

        assert_eq!(result.unwrap(), EmitSummary { emitted: 2, skipped: 1 });
        let eids: Vec<u64> = written.iter().map(|o| o.eid()).collect();
        assert_eq!(eids, vec![0, 2]);
        // The first try plus three retries.
        assert_eq!(remote.calls_for(1).len(), 4);
        assert_eq!(remote.calls_for(2).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_through_policy_emits_original_event() {
        let remote = Arc::new(ScriptedCall::new().fail_permanently(0));
        let strategy = RetryCall::new(remote.clone(), policy(), 10, OnOperationFailure::PassThrough);

        let (result, written) = run(&strategy, batch(2)).await;

        assert_eq!(result.unwrap(), EmitSummary { emitted: 2, skipped: 0 });
        assert_eq!(written[0].enrichment, None);
        assert!(written[1].enrichment.is_some());
        assert_eq!(remote.calls_for(0).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_policy_fails_the_batch() {
        let remote = Arc::new(ScriptedCall::new().fail_permanently(1));
        let strategy = RetryCall::new(remote, policy(), 10, OnOperationFailure::Abort);

        let (result, _) = run(&strategy, batch(3)).await;

        match result {
            Err(EngineError::OperationFailed(failed)) => {
                assert_eq!(failed.eid, 1);
                assert_eq!(failed.attempts, 1);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_applies_to_calls() {
        let remote = Arc::new(
            ScriptedCall::new()
                .delay(0, time::Duration::from_secs(1))
                .delay(1, time::Duration::from_secs(1))
                .delay(2, time::Duration::from_secs(1)),
        );
        let strategy = RetryCall::new(remote.clone(), policy(), 2, OnOperationFailure::Skip);
        let start = tokio::time::Instant::now();

        let (result, _) = run(&strategy, batch(3)).await;

        result.unwrap();
        assert_eq!(remote.calls_for(2)[0] - start, time::Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_keep_running_while_the_sink_applies_backpressure() {
        let remote = Arc::new(
            ScriptedCall::new()
                .delay(0, time::Duration::from_secs(1))
                .delay(1, time::Duration::from_secs(2))
                .delay(2, time::Duration::from_secs(1)),
        );
        let strategy = RetryCall::new(remote.clone(), policy(), 2, OnOperationFailure::Skip);
        let mut sink = RecordingSink::with_capacity(1).ready_after(time::Duration::from_secs(30));
        let handle = sink.handle();
        let start = tokio::time::Instant::now();

        let mut emitter = OrderedEmitter::new(&mut sink, 3);
        strategy.enrich(batch(3), &mut emitter).await.unwrap();
        let summary = emitter.finish().unwrap();

        assert_eq!(summary, EmitSummary { emitted: 3, skipped: 0 });
        assert_eq!(handle.written_eids(), vec![0, 1, 2]);
        // The third call starts when the first one lands, while the sink is still catching up.
        assert_eq!(remote.calls_for(2), vec![start + time::Duration::from_secs(1)]);
        assert_eq!(remote.calls().len(), 3);
    }

    #[test]
    fn test_failure_policy_from_str() {
        assert_eq!("skip".parse::<OnOperationFailure>(), Ok(OnOperationFailure::Skip));
        assert_eq!(
            "pass-through".parse::<OnOperationFailure>(),
            Ok(OnOperationFailure::PassThrough)
        );
        assert_eq!("ABORT".parse::<OnOperationFailure>(), Ok(OnOperationFailure::Abort));
        assert!("retry".parse::<OnOperationFailure>().is_err());
    }
}

use std::future::Future;

use futures::{Stream, StreamExt, TryStreamExt};

use crate::metrics_consts::{EXECUTOR_IN_FLIGHT, OPERATIONS_ISSUED};

/// Counts one operation in `EXECUTOR_IN_FLIGHT` until dropped, whether it completed or was
/// abandoned mid-flight.
struct InFlight;

impl InFlight {
    fn start() -> Self {
        metrics::gauge!(EXECUTOR_IN_FLIGHT).increment(1.0);
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::gauge!(EXECUTOR_IN_FLIGHT).decrement(1.0);
    }
}

/// Runs independent external operations with at most `limit` of them in flight.
///
/// Operations are polled from the pipeline task itself, so concurrency here means interleaved
/// I/O, not parallel compute.
#[derive(Debug, Clone, Copy)]
pub struct BoundedExecutor {
    limit: usize,
}

impl BoundedExecutor {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Yields each operation's output as it completes, in completion order.
    pub fn stream<I>(&self, operations: I) -> impl Stream<Item = <I::Item as Future>::Output>
    where
        I: IntoIterator,
        I::Item: Future,
    {
        futures::stream::iter(operations.into_iter().map(|operation| async move {
            metrics::counter!(OPERATIONS_ISSUED).increment(1);
            let _in_flight = InFlight::start();
            operation.await
        }))
        .buffer_unordered(self.limit)
    }

    /// Runs every operation and collects the outputs in completion order. The first error is
    /// returned as soon as it is seen, and the operations still in flight are dropped.
    pub async fn try_execute<I, T, E>(&self, operations: I) -> Result<Vec<T>, E>
    where
        I: IntoIterator,
        I::Item: Future<Output = Result<T, E>>,
    {
        self.stream(operations).try_collect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_limit() {
        let executor = BoundedExecutor::new(3);
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let (active, peak) = (&active, &peak);

        let operations = (0..10u64).map(|i| async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10 * (i % 4 + 1))).await;
            active.fetch_sub(1, Ordering::SeqCst);
            Ok::<u64, ()>(i)
        });

        let mut results = executor.try_execute(operations).await.unwrap();
        results.sort_unstable();

        assert_eq!(results, (0..10).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_yields_in_completion_order() {
        let executor = BoundedExecutor::new(4);
        let delays = [40u64, 10, 30, 20];

        let operations = delays.iter().enumerate().map(|(i, delay)| async move {
            tokio::time::sleep(Duration::from_millis(*delay)).await;
            i
        });
        let order: Vec<usize> = executor.stream(operations).collect().await;

        assert_eq!(order, vec![1, 3, 2, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_error_fails_fast() {
        let executor = BoundedExecutor::new(2);
        let finished = AtomicUsize::new(0);
        let finished_ref = &finished;

        let operations = (0..4u64).map(|i| async move {
            if i == 0 {
                return Err(format!("operation {i} failed"));
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            finished_ref.fetch_add(1, Ordering::SeqCst);
            Ok(i)
        });

        let result = executor.try_execute(operations).await;

        assert_eq!(result, Err("operation 0 failed".to_owned()));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_operations_leave_the_in_flight_gauge() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _recorder = metrics::set_default_local_recorder(&recorder);

        let executor = BoundedExecutor::new(3);
        let operations = (0..3u64).map(|i| async move {
            if i == 0 {
                return Err("operation 0 failed");
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(i)
        });
        assert_eq!(executor.try_execute(operations).await, Err("operation 0 failed"));

        let in_flight = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(key, _, _, _)| key.key().name() == EXECUTOR_IN_FLIGHT)
            .and_then(|(_, _, _, value)| match value {
                DebugValue::Gauge(v) => Some(v.into_inner()),
                _ => None,
            });
        assert_eq!(in_flight, Some(0.0));
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        assert_eq!(BoundedExecutor::new(0).limit(), 1);
    }
}

//! # Pipeline
//!
//! Drives one enrichment stage: read upstream into the accumulator, hand each released batch
//! to the strategy, flush the sink, then advance the checkpoint. Nothing advances until the
//! sink acknowledged every output of the batch.
use std::time;

use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::BatchAccumulator;
use crate::checkpoint::{CheckpointCoordinator, CheckpointStore};
use crate::emitter::{EmitSummary, OrderedEmitter};
use crate::error::EngineError;
use crate::event::{Batch, Event};
use crate::health::{ComponentStatus, HealthHandle};
use crate::metrics_consts::{BATCHES_FAILED, BATCH_DURATION, EVENTS_RECEIVED};
use crate::sink::Sink;
use crate::source::EventSource;
use crate::strategy::Enricher;

/// How often the pipeline reports healthy while it waits on upstream or on a batch in flight.
const HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Release a batch once it holds this many events.
    pub batch_size: usize,
    /// Release a batch this long after its first event arrived. `None` waits for size only.
    pub batch_time: Option<time::Duration>,
    /// External operations in flight per batch.
    pub concurrency_limit: usize,
    /// How long the sink gets to acknowledge a batch's flush.
    pub flush_timeout: time::Duration,
}

impl EngineConfig {
    /// Large batches with no time bound, for the join-fetch strategy.
    pub fn relational() -> Self {
        Self {
            batch_size: 5000,
            batch_time: None,
            concurrency_limit: 10,
            flush_timeout: time::Duration::from_secs(30),
        }
    }

    /// Small batches released at least every ten seconds, for the retry-call strategy.
    pub fn api() -> Self {
        Self {
            batch_size: 40,
            batch_time: Some(time::Duration::from_secs(10)),
            concurrency_limit: 10,
            flush_timeout: time::Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.batch_size == 0 {
            return Err(EngineError::InvalidConfig(
                "batch size must be at least 1".to_owned(),
            ));
        }
        if self.concurrency_limit == 0 {
            return Err(EngineError::InvalidConfig(
                "concurrency limit must be at least 1".to_owned(),
            ));
        }
        if self.batch_time.is_some_and(|t| t.is_zero()) {
            return Err(EngineError::InvalidConfig(
                "batch time must be positive, leave it unset for no time bound".to_owned(),
            ));
        }
        if self.flush_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(
                "flush timeout must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// What a pipeline did before upstream ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub batches: usize,
    pub events_in: usize,
    pub outputs_emitted: usize,
    pub outputs_skipped: usize,
    /// Last position the checkpoint store was advanced to.
    pub checkpoint: Option<u64>,
}

pub struct Pipeline<S, K, C, E> {
    config: EngineConfig,
    source: S,
    sink: K,
    coordinator: CheckpointCoordinator<C>,
    enricher: E,
    accumulator: BatchAccumulator,
    upstream_open: bool,
    liveness: Option<HealthHandle>,
    report: PipelineReport,
}

impl<S, K, C, E> Pipeline<S, K, C, E>
where
    S: EventSource,
    K: Sink,
    C: CheckpointStore,
    E: Enricher,
{
    pub fn new(
        config: EngineConfig,
        source: S,
        sink: K,
        checkpoint: C,
        enricher: E,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let accumulator = BatchAccumulator::new(config.batch_size, config.batch_time);

        Ok(Self {
            config,
            source,
            sink,
            coordinator: CheckpointCoordinator::new(checkpoint),
            enricher,
            accumulator,
            upstream_open: true,
            liveness: None,
            report: PipelineReport::default(),
        })
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Run until upstream ends or a batch fails. The partial batch left at upstream end is
    /// flushed, then the checkpoint store is finished. On failure the batch in flight is
    /// dropped without advancing, and the error is returned.
    pub async fn run(mut self) -> Result<PipelineReport, EngineError> {
        info!(
            strategy = self.enricher.name(),
            batch_size = self.config.batch_size,
            batch_time = ?self.config.batch_time,
            concurrency_limit = self.config.concurrency_limit,
            "starting pipeline"
        );

        match self.drive().await {
            Ok(()) => {
                self.coordinator.finish().await?;
                self.report.checkpoint = self.coordinator.position();
                info!(report = ?self.report, "upstream ended, pipeline finished");
                Ok(self.report)
            }
            Err(e) => {
                metrics::counter!(BATCHES_FAILED).increment(1);
                error!(position = ?self.coordinator.position(), "pipeline failed: {}", e);

                if let Some(liveness) = &self.liveness {
                    liveness.report_status(ComponentStatus::Unhealthy);
                }
                self.coordinator.abort();
                if let Err(finish_error) = self.coordinator.finish().await {
                    warn!("failed to finish checkpoint after error: {}", finish_error);
                }
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<(), EngineError> {
        while let Some(batch) = self.next_batch().await? {
            self.process(batch).await?;
        }
        Ok(())
    }

    fn heartbeat(&self) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }

    /// Buffer upstream events until a threshold releases a batch. Once upstream has ended,
    /// releases what is left, then `None`.
    async fn next_batch(&mut self) -> Result<Option<Batch>, EngineError> {
        loop {
            self.heartbeat();

            if let Some(batch) = self.accumulator.take_ready() {
                return Ok(Some(batch));
            }
            if !self.upstream_open {
                let batch = self.accumulator.flush();
                return Ok((!batch.is_empty()).then_some(batch));
            }

            let deadline = self.accumulator.deadline();
            tokio::select! {
                next = self.source.next_event() => match next {
                    Some(Ok(event)) => buffer(
                        &mut self.accumulator,
                        &mut self.coordinator,
                        &mut self.report,
                        event,
                    ),
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        debug!("upstream ended");
                        self.upstream_open = false;
                    }
                },
                _ = sleep_until(deadline) => {}
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL), if self.liveness.is_some() => {}
            }
        }
    }

    #[instrument(skip_all, fields(size = batch.len(), last_eid = batch.last_eid()))]
    async fn process(&mut self, batch: Batch) -> Result<(), EngineError> {
        let Some(last_eid) = batch.last_eid() else {
            return Ok(());
        };
        let start = Instant::now();
        self.coordinator.begin_flush(last_eid);

        let Pipeline {
            config,
            source,
            sink,
            coordinator,
            enricher,
            accumulator,
            upstream_open,
            liveness,
            report,
        } = self;

        let overlaps = enricher.overlaps_accumulation();
        let cycle = run_cycle(&*enricher, sink, batch, config.flush_timeout);
        tokio::pin!(cycle);
        let summary = loop {
            if let Some(handle) = liveness.as_ref() {
                handle.report_healthy();
            }
            tokio::select! {
                biased;
                summary = &mut cycle => break summary?,
                // Overlapping strategies keep buffering the next batch meanwhile.
                next = source.next_event(), if overlaps && *upstream_open && !accumulator.is_ready() => {
                    match next {
                        Some(Ok(event)) => buffer(accumulator, coordinator, report, event),
                        Some(Err(e)) => return Err(e.into()),
                        None => *upstream_open = false,
                    }
                }
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL), if liveness.is_some() => {}
            }
        };

        coordinator
            .complete_flush(!accumulator.is_empty())
            .await?;

        report.batches += 1;
        report.outputs_emitted += summary.emitted;
        report.outputs_skipped += summary.skipped;

        let elapsed = start.elapsed();
        metrics::histogram!(BATCH_DURATION).record(elapsed.as_secs_f64());
        debug!(
            emitted = summary.emitted,
            skipped = summary.skipped,
            ?elapsed,
            "batch completed"
        );
        Ok(())
    }
}

fn buffer<C: CheckpointStore>(
    accumulator: &mut BatchAccumulator,
    coordinator: &mut CheckpointCoordinator<C>,
    report: &mut PipelineReport,
    event: Event,
) {
    metrics::counter!(EVENTS_RECEIVED).increment(1);
    report.events_in += 1;
    coordinator.on_buffered();
    accumulator.accept(event);
}

/// Enrich and emit one batch, then wait for the sink to acknowledge it.
async fn run_cycle<E, K>(
    enricher: &E,
    sink: &mut K,
    batch: Batch,
    flush_timeout: time::Duration,
) -> Result<EmitSummary, EngineError>
where
    E: Enricher + ?Sized,
    K: Sink,
{
    let mut emitter = OrderedEmitter::new(&mut *sink, batch.len());
    enricher.enrich(batch, &mut emitter).await?;
    let summary = emitter.finish()?;

    match tokio::time::timeout(flush_timeout, sink.flush()).await {
        Ok(flushed) => flushed?,
        Err(_) => return Err(EngineError::FlushTimeout(flush_timeout)),
    }
    Ok(summary)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

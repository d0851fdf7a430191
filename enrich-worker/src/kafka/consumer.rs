use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use enrich_common::checkpoint::CheckpointStore;
use enrich_common::error::{CheckpointError, SourceError};
use enrich_common::event::Event;
use enrich_common::metrics_consts::POISON_PILLS;
use enrich_common::source::EventSource;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

/// Consumed offsets not yet stored for commit, in arrival order.
#[derive(Debug, Default)]
struct OffsetLedger {
    pending: VecDeque<PendingOffset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingOffset {
    /// `None` for a poison pill, which never reaches the pipeline.
    eid: Option<u64>,
    partition: i32,
    offset: i64,
}

impl OffsetLedger {
    fn track(&mut self, eid: u64, partition: i32, offset: i64) {
        self.pending.push_back(PendingOffset {
            eid: Some(eid),
            partition,
            offset,
        });
    }

    /// Queue a poison pill behind the events read before it. Returns false when nothing is
    /// ahead of it, in which case it can be stored right away.
    fn track_poison(&mut self, partition: i32, offset: i64) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        self.pending.push_back(PendingOffset {
            eid: None,
            partition,
            offset,
        });
        true
    }

    /// Remove everything up to `position` and the poison pills directly behind it, returning
    /// the highest offset per partition.
    fn drain_through(&mut self, position: u64) -> Vec<(i32, i64)> {
        let mut latest: BTreeMap<i32, i64> = BTreeMap::new();

        while let Some(front) = self.pending.front() {
            if front.eid.is_some_and(|eid| eid > position) {
                break;
            }
            let PendingOffset {
                partition, offset, ..
            } = *front;
            self.pending.pop_front();

            latest
                .entry(partition)
                .and_modify(|latest| *latest = (*latest).max(offset))
                .or_insert(offset);
        }

        latest.into_iter().collect()
    }
}

type SharedLedger = Arc<Mutex<OffsetLedger>>;

/// Reads JSON events from a single topic, stopping when `shutdown` is cancelled.
///
/// Empty and non-JSON messages are poison pills: they are logged and skipped, and their
/// offsets are stored once every event read before them is checkpointed.
pub struct KafkaSource {
    inner: Arc<Inner>,
    ledger: SharedLedger,
    next_eid: u64,
    shutdown: CancellationToken,
}

/// Stores consumed offsets for commit as the pipeline advances past them.
pub struct KafkaCheckpoint {
    handle: Weak<Inner>,
    ledger: SharedLedger,
}

impl KafkaSource {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        shutdown: CancellationToken,
    ) -> Result<(Self, KafkaCheckpoint), KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set(
                "enable.auto.commit",
                consumer_config.kafka_consumer_auto_commit.to_string(),
            )
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            );

        client_config.set("enable.auto.offset.store", "false");

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;
        info!(
            topic = %consumer_config.kafka_consumer_topic,
            group = %consumer_config.kafka_consumer_group,
            "subscribed to upstream topic"
        );

        let inner = Arc::new(Inner {
            consumer,
            topic: consumer_config.kafka_consumer_topic.clone(),
        });
        let ledger = SharedLedger::default();

        let checkpoint = KafkaCheckpoint {
            handle: Arc::downgrade(&inner),
            ledger: ledger.clone(),
        };
        let source = Self {
            inner,
            ledger,
            next_eid: 0,
            shutdown,
        };
        Ok((source, checkpoint))
    }

    fn skip_poison_pill(&self, partition: i32, offset: i64) -> Result<(), SourceError> {
        metrics::counter!(POISON_PILLS).increment(1);

        let queued = self
            .ledger
            .lock()
            .map_err(|_| SourceError::Read("poisoned offset ledger".to_owned()))?
            .track_poison(partition, offset);

        if !queued {
            self.inner
                .consumer
                .store_offset(&self.inner.topic, partition, offset)
                .map_err(|e| SourceError::Read(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventSource for KafkaSource {
    async fn next_event(&mut self) -> Option<Result<Event, SourceError>> {
        loop {
            // `recv` only takes a message off the queue when it resolves.
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested, no longer reading upstream");
                    return None;
                }
                received = self.inner.consumer.recv() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => return Some(Err(SourceError::Read(e.to_string()))),
            };
            let (partition, offset) = (message.partition(), message.offset());

            let parsed = match message.payload() {
                Some(payload) => serde_json::from_slice(payload).map_err(|e| e.to_string()),
                None => Err("empty payload".to_owned()),
            };

            match parsed {
                Ok(payload) => {
                    let eid = self.next_eid;
                    match self.ledger.lock() {
                        Ok(mut ledger) => ledger.track(eid, partition, offset),
                        Err(_) => {
                            return Some(Err(SourceError::Read(
                                "poisoned offset ledger".to_owned(),
                            )))
                        }
                    }
                    self.next_eid += 1;
                    return Some(Ok(Event::new(eid, payload)));
                }
                Err(reason) => {
                    warn!(partition, offset, "skipping poison pill: {}", reason);
                    if let Err(e) = self.skip_poison_pill(partition, offset) {
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl CheckpointStore for KafkaCheckpoint {
    async fn advance(&mut self, position: u64) -> Result<(), CheckpointError> {
        let inner = self.handle.upgrade().ok_or(CheckpointError::Gone)?;
        let offsets = self
            .ledger
            .lock()
            .map_err(|_| CheckpointError::Advance {
                position,
                message: "poisoned offset ledger".to_owned(),
            })?
            .drain_through(position);

        for (partition, offset) in offsets {
            inner
                .consumer
                .store_offset(&inner.topic, partition, offset)
                .map_err(|e| CheckpointError::Advance {
                    position,
                    message: e.to_string(),
                })?;
            debug!(partition, offset, "stored offset");
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), CheckpointError> {
        let inner = self.handle.upgrade().ok_or(CheckpointError::Gone)?;

        let committed =
            tokio::task::spawn_blocking(move || inner.consumer.commit_consumer_state(CommitMode::Sync))
                .await
                .map_err(|e| CheckpointError::Finish(e.to_string()))?;

        match committed {
            Ok(()) => {
                info!("committed stored offsets");
                Ok(())
            }
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                debug!("no stored offsets to commit");
                Ok(())
            }
            Err(e) => Err(CheckpointError::Finish(e.to_string())),
        }
    }
}

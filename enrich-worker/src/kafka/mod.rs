//! Kafka as upstream, checkpoint store and downstream.
//!
//! Events are consumed from a single topic and numbered in arrival order. Their offsets are
//! stored for commit only once the pipeline advanced its checkpoint past them, so a restart
//! redelivers everything the pipeline had not acknowledged.
mod consumer;
mod producer;

pub use consumer::{KafkaCheckpoint, KafkaSource};
pub use producer::{create_kafka_producer, KafkaContext, KafkaSink};

#[cfg(test)]
pub(crate) mod test;

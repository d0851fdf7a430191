use enrich_common::health::HealthRegistry;
use rdkafka::mocking::MockCluster;
use rdkafka::ClientContext;

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::kafka::KafkaSink;

pub fn kafka_config<C: ClientContext>(cluster: &MockCluster<'_, C>) -> KafkaConfig {
    KafkaConfig {
        kafka_producer_linger_ms: 0,
        kafka_producer_queue_mib: 50,
        kafka_message_timeout_ms: 5000,
        kafka_compression_codec: "none".to_string(),
        kafka_tls: false,
        kafka_hosts: cluster.bootstrap_servers(),
    }
}

pub fn consumer_config(topic: &str) -> ConsumerConfig {
    ConsumerConfig {
        kafka_consumer_group: "enrichment-test".to_string(),
        kafka_consumer_topic: topic.to_string(),
        kafka_consumer_offset_reset: "earliest".to_string(),
        kafka_consumer_auto_commit: false,
        kafka_consumer_auto_commit_interval_ms: 5000,
    }
}

/// A sink keyed by the payload's `user_id`.
pub async fn create_mock_sink<C: ClientContext>(
    cluster: &MockCluster<'_, C>,
    topic: &str,
    max_in_flight: usize,
) -> KafkaSink {
    let registry = HealthRegistry::new("liveness");
    let handle = registry.register("rdkafka", time::Duration::seconds(30));

    KafkaSink::new(
        &kafka_config(cluster),
        topic,
        Some("/user_id".to_owned()),
        max_in_flight,
        handle,
    )
    .await
    .expect("failed to create mocked kafka sink")
}

use async_trait::async_trait;
use enrich_common::error::SinkError;
use enrich_common::event::AssembledOutput;
use enrich_common::health::HealthHandle;
use enrich_common::metrics_consts::DELIVERIES_FAILED;
use enrich_common::sink::Sink;
use futures::stream::{FuturesUnordered, StreamExt};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        // Retries must not reorder outputs within a partition.
        .set("enable.idempotence", "true");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

/// Produces assembled outputs as JSON to a single topic.
///
/// At most `max_in_flight` deliveries are unacknowledged at once; a flush waits for all of
/// them. When `key_pointer` is set, the string or number it points to in the event payload
/// keys the message.
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    key_pointer: Option<String>,
    max_in_flight: usize,
    in_flight: FuturesUnordered<DeliveryFuture>,
}

impl KafkaSink {
    pub async fn new(
        config: &KafkaConfig,
        topic: &str,
        key_pointer: Option<String>,
        max_in_flight: usize,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let producer = create_kafka_producer(config, liveness).await?;
        Ok(Self::from_producer(
            producer,
            topic,
            key_pointer,
            max_in_flight,
        ))
    }

    pub fn from_producer(
        producer: FutureProducer<KafkaContext>,
        topic: &str,
        key_pointer: Option<String>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
            key_pointer,
            max_in_flight: max_in_flight.max(1),
            in_flight: FuturesUnordered::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

fn message_key(payload: &Value, pointer: &str) -> Option<String> {
    match payload.pointer(pointer)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Wait for one outstanding delivery to be acknowledged.
async fn await_delivery(in_flight: &mut FuturesUnordered<DeliveryFuture>) -> Result<(), SinkError> {
    match in_flight.next().await {
        None | Some(Ok(Ok(_))) => Ok(()),
        Some(Ok(Err((e, _)))) => {
            metrics::counter!(DELIVERIES_FAILED).increment(1);
            Err(SinkError::Flush(e.to_string()))
        }
        // The producer dropped the delivery without reporting on it.
        Some(Err(_)) => Err(SinkError::Closed),
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn write(&mut self, output: AssembledOutput) -> Result<bool, SinkError> {
        let payload =
            serde_json::to_string(&output).map_err(|e| SinkError::Write(e.to_string()))?;
        let key = self
            .key_pointer
            .as_deref()
            .and_then(|pointer| message_key(&output.event.payload, pointer));

        let mut record = FutureRecord::<str, str>::to(&self.topic).payload(&payload);
        if let Some(key) = key.as_deref() {
            record = record.key(key);
        }

        loop {
            match self.producer.send_result(record) {
                Ok(delivery) => {
                    self.in_flight.push(delivery);
                    break;
                }
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned))
                    if !self.in_flight.is_empty() =>
                {
                    record = returned;
                    await_delivery(&mut self.in_flight).await?;
                }
                Err((e, _)) => return Err(SinkError::Write(e.to_string())),
            }
        }

        Ok(self.in_flight.len() < self.max_in_flight)
    }

    async fn ready(&mut self) -> Result<(), SinkError> {
        while self.in_flight.len() >= self.max_in_flight {
            await_delivery(&mut self.in_flight).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        while !self.in_flight.is_empty() {
            await_delivery(&mut self.in_flight).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use enrich_common::event::Event;
    use rdkafka::consumer::{Consumer, StreamConsumer};
    use rdkafka::mocking::MockCluster;
    use rdkafka::Message;
    use serde_json::json;

    use super::*;
    use crate::kafka::test::create_mock_sink;

    #[test]
    fn test_message_key() {
        let payload = json!({"user": {"id": 42, "email": "a@example.com", "tags": ["x"]}});

        assert_eq!(message_key(&payload, "/user/id"), Some("42".to_owned()));
        assert_eq!(
            message_key(&payload, "/user/email"),
            Some("a@example.com".to_owned())
        );
        assert_eq!(message_key(&payload, "/user/tags"), None);
        assert_eq!(message_key(&payload, "/missing"), None);
    }

    #[tokio::test]
    async fn test_sink_reports_capacity() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        cluster
            .create_topic("enriched", 1, 1)
            .expect("failed to create topic");
        let mut sink = create_mock_sink(&cluster, "enriched", 2).await;

        let output = |eid| AssembledOutput::pass_through(Event::new(eid, json!({"eid": eid})));
        assert!(sink.write(output(0)).await.unwrap());
        assert!(!sink.write(output(1)).await.unwrap());

        sink.ready().await.unwrap();
        assert!(sink.in_flight() < 2);

        sink.flush().await.unwrap();
        assert_eq!(sink.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_outputs_are_produced_in_order() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        cluster
            .create_topic("enriched", 1, 1)
            .expect("failed to create topic");
        let mut sink = create_mock_sink(&cluster, "enriched", 100).await;

        for eid in 0..3 {
            let event = Event::new(eid, json!({"user_id": eid * 10}));
            let output = AssembledOutput::enriched(event, json!({"person": []}));
            assert!(sink.write(output).await.unwrap());
        }
        sink.flush().await.unwrap();

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", cluster.bootstrap_servers())
            .set("group.id", "sink-test")
            .set("auto.offset.reset", "earliest")
            .create()
            .expect("failed to create consumer");
        consumer.subscribe(&["enriched"]).unwrap();

        for eid in 0..3u64 {
            let message = tokio::time::timeout(Duration::from_secs(30), consumer.recv())
                .await
                .expect("timed out waiting for output")
                .unwrap();

            let produced: Value = serde_json::from_slice(message.payload().unwrap()).unwrap();
            assert_eq!(produced["eid"], json!(eid));
            assert_eq!(produced["payload"], json!({"user_id": eid * 10}));
            assert_eq!(produced["enrichment"], json!({"person": []}));
            assert_eq!(
                message.key(),
                Some((eid * 10).to_string().as_bytes())
            );
        }
    }
}

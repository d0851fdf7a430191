use std::str::FromStr;
use std::time;

use enrich_common::pipeline::EngineConfig;
use enrich_common::retry::RetryPolicy;
use enrich_common::strategy::{EntityDefinition, OnOperationFailure};
use envconfig::Envconfig;

use crate::error::WorkerError;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "relational")]
    pub enrichment_mode: EnrichmentMode,

    /// Overrides the mode's preset.
    pub batch_size: Option<usize>,

    /// Overrides the mode's preset. 0 disables the time bound.
    pub batch_time_ms: Option<u64>,

    pub concurrency_limit: Option<usize>,

    #[envconfig(default = "30000")]
    pub flush_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(default = "enriched_events")]
    pub kafka_output_topic: NonEmptyString,

    /// JSON pointer into the event payload used as the output message key.
    pub kafka_output_key_pointer: Option<String>,

    #[envconfig(default = "1000")]
    pub max_in_flight_deliveries: usize,

    pub database_url: Option<String>,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    pub entity_definition_path: Option<String>,

    pub endpoint_url: Option<String>,

    #[envconfig(default = "POST")]
    pub endpoint_method: NonEmptyString,

    #[envconfig(default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "skip")]
    pub on_operation_failure: OnOperationFailure,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The mode's preset with any explicit overrides applied.
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = match self.enrichment_mode {
            EnrichmentMode::Relational => EngineConfig::relational(),
            EnrichmentMode::Api => EngineConfig::api(),
        };

        if let Some(batch_size) = self.batch_size {
            engine.batch_size = batch_size;
        }
        match self.batch_time_ms {
            Some(0) => engine.batch_time = None,
            Some(ms) => engine.batch_time = Some(time::Duration::from_millis(ms)),
            None => {}
        }
        if let Some(limit) = self.concurrency_limit {
            engine.concurrency_limit = limit;
        }
        engine.flush_timeout = self.flush_timeout.0;
        engine
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let mut builder = RetryPolicy::build(
            self.retry_policy.backoff_coefficient,
            self.retry_policy.initial_interval.0,
        )
        .max_retries(self.retry_policy.max_retries);

        if let Some(maximum) = self.retry_policy.maximum_interval {
            builder = builder.maximum_interval(maximum.0);
        }
        builder.provide()
    }

    /// Check that the settings the selected mode needs are present and consistent.
    pub fn validate(&self) -> Result<(), WorkerError> {
        self.engine_config().validate()?;

        if self.max_in_flight_deliveries == 0 {
            return Err(WorkerError::InvalidSettings(
                "MAX_IN_FLIGHT_DELIVERIES must be at least 1".to_owned(),
            ));
        }

        match self.enrichment_mode {
            EnrichmentMode::Relational => {
                if self.database_url.is_none() {
                    return Err(WorkerError::InvalidSettings(
                        "DATABASE_URL is required in relational mode".to_owned(),
                    ));
                }
                if self.entity_definition_path.is_none() {
                    return Err(WorkerError::InvalidSettings(
                        "ENTITY_DEFINITION_PATH is required in relational mode".to_owned(),
                    ));
                }
            }
            EnrichmentMode::Api => {
                if self.endpoint_url.is_none() {
                    return Err(WorkerError::InvalidSettings(
                        "ENDPOINT_URL is required in api mode".to_owned(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentMode {
    /// Join-fetch against a relational store.
    Relational,
    /// One retried call per event against a remote endpoint.
    Api,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnrichmentModeError;

impl FromStr for EnrichmentMode {
    type Err = ParseEnrichmentModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" => Ok(EnrichmentMode::Relational),
            "api" => Ok(EnrichmentMode::Api),
            _ => Err(ParseEnrichmentModeError),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    #[envconfig(default = "enrichment")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Only stored offsets are committed, and offsets are stored once the checkpoint passes them.
    #[envconfig(default = "true")]
    pub kafka_consumer_auto_commit: bool,

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: i32,
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "3")]
    pub max_retries: u32,

    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "2000")]
    pub initial_interval: EnvMsDuration,

    pub maximum_interval: Option<EnvMsDuration>,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Read and validate the entity definition the join-fetch strategy runs.
pub fn load_definition(path: &str) -> Result<EntityDefinition, WorkerError> {
    let raw = std::fs::read_to_string(path)?;
    let definition: EntityDefinition = serde_json::from_str(&raw)?;
    definition.validate()?;
    Ok(definition)
}

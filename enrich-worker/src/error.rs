use enrich_common::error::EngineError;
use metrics_exporter_prometheus::BuildError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors that stop the worker from starting or end its run.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] envconfig::Error),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("{0} is not a valid HTTP method")]
    ParseHttpMethod(String),
    #[error("error parsing endpoint url: {0}")]
    ParseUrl(#[from] url::ParseError),
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse entity definition: {0}")]
    Definition(#[from] serde_json::Error),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] BuildError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

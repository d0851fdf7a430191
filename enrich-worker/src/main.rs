//! Consume events from Kafka, enrich them in batches, and produce the results back to Kafka.
use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use enrich_common::health::{HealthHandle, HealthRegistry};
use enrich_common::metrics::{serve, setup_metrics_routes};
use enrich_common::pipeline::{Pipeline, PipelineReport};
use enrich_common::strategy::{Enricher, JoinFetch, RetryCall};
use enrich_worker::config::{load_definition, Config, EnrichmentMode};
use enrich_worker::error::WorkerError;
use enrich_worker::http::HttpCaller;
use enrich_worker::kafka::{KafkaCheckpoint, KafkaSink, KafkaSource};
use enrich_worker::postgres::PgRowSource;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "enrichment worker"
}

fn start_health_liveness_server(
    config: &Config,
    liveness: HealthRegistry,
) -> Result<JoinHandle<()>, WorkerError> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve health and metrics on {}: {}", bind, e);
        }
    }))
}

/// Cancel `shutdown` on SIGINT or SIGTERM, letting the pipeline drain its last batch.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
    shutdown.cancel();
}

async fn run_pipeline<E: Enricher>(
    config: &Config,
    source: KafkaSource,
    sink: KafkaSink,
    checkpoint: KafkaCheckpoint,
    enricher: E,
    liveness: HealthHandle,
) -> Result<PipelineReport, WorkerError> {
    let pipeline = Pipeline::new(config.engine_config(), source, sink, checkpoint, enricher)?
        .with_liveness(liveness);
    Ok(pipeline.run().await?)
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env()?;
    config.validate()?;

    let liveness = HealthRegistry::new("liveness");
    let pipeline_liveness = liveness.register("pipeline", time::Duration::seconds(60));
    let producer_liveness = liveness.register("rdkafka", time::Duration::seconds(30));
    let _server = start_health_liveness_server(&config, liveness.clone())?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));

    let (source, checkpoint) = KafkaSource::new(&config.kafka, &config.consumer, shutdown)?;
    let sink = KafkaSink::new(
        &config.kafka,
        config.kafka_output_topic.as_str(),
        config.kafka_output_key_pointer.clone(),
        config.max_in_flight_deliveries,
        producer_liveness,
    )
    .await?;

    let engine = config.engine_config();
    let report = match config.enrichment_mode {
        EnrichmentMode::Relational => {
            let (Some(path), Some(database_url)) = (
                config.entity_definition_path.as_deref(),
                config.database_url.as_deref(),
            ) else {
                return Err(WorkerError::InvalidSettings(
                    "relational mode needs ENTITY_DEFINITION_PATH and DATABASE_URL".to_owned(),
                ));
            };
            let definition = load_definition(path)?;
            info!(entity = %definition.entity, "loaded entity definition");

            let rows = PgRowSource::connect(database_url, config.max_pg_connections).await?;
            let enricher = JoinFetch::new(definition, Arc::new(rows), engine.concurrency_limit);
            run_pipeline(&config, source, sink, checkpoint, enricher, pipeline_liveness).await?
        }
        EnrichmentMode::Api => {
            let Some(url) = config.endpoint_url.as_deref() else {
                return Err(WorkerError::InvalidSettings(
                    "api mode needs ENDPOINT_URL".to_owned(),
                ));
            };
            let caller = HttpCaller::new(
                url,
                config.endpoint_method.as_str(),
                config.request_timeout.0,
            )?;
            let enricher = RetryCall::new(
                Arc::new(caller),
                config.retry_policy(),
                engine.concurrency_limit,
                config.on_operation_failure,
            );
            run_pipeline(&config, source, sink, checkpoint, enricher, pipeline_liveness).await?
        }
    };

    info!(?report, "upstream closed, shutting down");
    Ok(())
}

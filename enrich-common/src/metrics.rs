//! Prometheus exposition for the worker's `/metrics` endpoint.
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::metrics_consts::{BATCH_DURATION, BATCH_SIZE, OPERATION_DURATION};

/// Single queries and remote calls, up to the longest request timeout.
const OPERATION_SECONDS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Whole batches, including backoff between retries and the flush.
const BATCH_SECONDS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

const BATCH_EVENTS: &[f64] = &[
    1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the `/metrics` endpoint to `router`, installing the global Prometheus recorder.
/// Call once per process.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router.route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    ))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    recorder_builder()?.install_recorder()
}

/// Histograms without buckets of their own are rendered as summaries.
fn recorder_builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(OPERATION_DURATION.to_owned()), OPERATION_SECONDS)?
        .set_buckets_for_metric(Matcher::Full(BATCH_DURATION.to_owned()), BATCH_SECONDS)?
        .set_buckets_for_metric(Matcher::Full(BATCH_SIZE.to_owned()), BATCH_EVENTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histograms_use_their_own_buckets() {
        let recorder = recorder_builder().unwrap().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            metrics::histogram!(OPERATION_DURATION).record(0.003);
            metrics::histogram!(BATCH_DURATION).record(90.0);
            metrics::histogram!(BATCH_SIZE).record(100.0);
        });
        let rendered = handle.render();

        assert!(rendered.contains(r#"enrich_operation_duration_seconds_bucket{le="0.0025"} 0"#));
        assert!(rendered.contains(r#"enrich_operation_duration_seconds_bucket{le="0.005"} 1"#));
        assert!(rendered.contains(r#"enrich_batch_duration_seconds_bucket{le="60"} 0"#));
        assert!(rendered.contains(r#"enrich_batch_duration_seconds_bucket{le="120"} 1"#));
        assert!(rendered.contains(r#"enrich_batch_size_bucket{le="100"} 1"#));
    }
}

use std::str::FromStr;
use std::time;

use async_trait::async_trait;
use enrich_common::error::OperationError;
use enrich_common::event::Event;
use enrich_common::strategy::RemoteCall;
use reqwest::header;
use serde_json::Value;

use crate::error::WorkerError;

/// Calls a remote enrichment endpoint with each event's payload as the JSON body.
///
/// Transport failures and non-2xx responses are transient, carrying the endpoint's
/// `Retry-After` hint when it sent one. A 2xx body that is not JSON is malformed.
pub struct HttpCaller {
    client: reqwest::Client,
    method: http::Method,
    url: reqwest::Url,
}

impl HttpCaller {
    pub fn new(url: &str, method: &str, request_timeout: time::Duration) -> Result<Self, WorkerError> {
        let url: reqwest::Url = url.parse()?;
        let method = http::Method::from_str(&method.to_ascii_uppercase())
            .map_err(|_| WorkerError::ParseHttpMethod(method.to_owned()))?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Enrichment Worker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            method,
            url,
        })
    }
}

#[async_trait]
impl RemoteCall for HttpCaller {
    async fn call(&self, event: &Event) -> Result<Value, OperationError> {
        let response = self
            .client
            .request(self.method.clone(), self.url.clone())
            .json(&event.payload)
            .send()
            .await
            .map_err(|e| OperationError::transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OperationError::Transient {
                message: format!("endpoint responded with {status}"),
                retry_after: parse_retry_after_header(response.headers()),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| OperationError::transient(e.to_string()))?;
        serde_json::from_slice(&body).map_err(OperationError::Malformed)
    }
}

/// Attempt to parse a duration from a Retry-After header, returning None if not possible.
/// Retry-After can specify a date in RFC2822 or a number of seconds; we try to parse both.
pub fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;

    fn caller(server: &MockServer) -> HttpCaller {
        HttpCaller::new(
            &server.url("/enrich"),
            "post",
            time::Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_call_returns_response_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/enrich")
                    .header("content-type", "application/json")
                    .json_body(json!({"user_id": 7}));
                then.status(200).json_body(json!({"plan": "enterprise"}));
            })
            .await;

        let event = Event::new(0, json!({"user_id": 7}));
        let value = caller(&server).call(&event).await.unwrap();

        assert_eq!(value, json!({"plan": "enterprise"}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_transient_with_retry_after() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/enrich");
                then.status(429).header("retry-after", "30");
            })
            .await;

        let error = caller(&server)
            .call(&Event::new(0, json!({})))
            .await
            .unwrap_err();

        assert!(error.is_retryable());
        assert_eq!(error.retry_after(), Some(time::Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_client_errors_are_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/enrich");
                then.status(404);
            })
            .await;

        let error = caller(&server)
            .call(&Event::new(0, json!({})))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            OperationError::Transient {
                retry_after: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_non_json_body_is_malformed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/enrich");
                then.status(200).body("<html>not json</html>");
            })
            .await;

        let error = caller(&server)
            .call(&Event::new(0, json!({})))
            .await
            .unwrap_err();

        assert!(matches!(error, OperationError::Malformed(_)));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let caller = HttpCaller::new(
            "http://127.0.0.1:1/enrich",
            "POST",
            time::Duration::from_secs(1),
        )
        .unwrap();

        let error = caller.call(&Event::new(0, json!({}))).await.unwrap_err();
        assert!(matches!(error, OperationError::Transient { .. }));
    }

    #[test]
    fn test_invalid_settings() {
        assert!(matches!(
            HttpCaller::new("not a url", "POST", time::Duration::from_secs(1)),
            Err(WorkerError::ParseUrl(_))
        ));
        assert!(matches!(
            HttpCaller::new("http://localhost/", "NOT A METHOD", time::Duration::from_secs(1)),
            Err(WorkerError::ParseHttpMethod(_))
        ));
    }

    #[test]
    fn test_parse_retry_after_header() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, "120".parse().unwrap());

        let duration = parse_retry_after_header(&headers).unwrap();
        assert_eq!(duration, time::Duration::from_secs(120));

        headers.remove(header::RETRY_AFTER);
        assert_eq!(parse_retry_after_header(&headers), None);

        // Dates in the past yield no hint.
        headers.insert(
            header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after_header(&headers), None);

        let future = chrono::Utc::now() + chrono::Duration::seconds(90);
        headers.insert(
            header::RETRY_AFTER,
            future.to_rfc2822().parse().unwrap(),
        );
        let duration = parse_retry_after_header(&headers).unwrap();
        assert!(duration > time::Duration::from_secs(80));
        assert!(duration <= time::Duration::from_secs(90));
    }
}

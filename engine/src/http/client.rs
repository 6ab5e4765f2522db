//! Outbound HTTP client used by notification channels

use std::time::Duration;

use reqwest::{header, Client};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::errors::EngineError;

/// Longest response body kept in an error
const MAX_ERROR_BODY: usize = 512;

#[derive(Error, Debug)]
pub enum HttpClientError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        source: reqwest::Error,
    },

    #[error("{url} answered {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
}

/// JSON-over-HTTP client with a request timeout
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("empaasd/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// POST a JSON body. `url` is never logged in full since webhook URLs
    /// carry credentials.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        headers: &[(&str, String)],
        body: &B,
    ) -> Result<(), HttpClientError> {
        let redacted = redact_url(url);
        debug!("POST {}", redacted);

        let mut request = self
            .client
            .post(url)
            .header(header::ACCEPT, "application/json")
            .json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = request.send().await.map_err(|source| HttpClientError::Request {
            url: redacted.clone(),
            source: source.without_url(),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
            error!("HTTP POST failed: {} - {}", status, body);
            return Err(HttpClientError::Status {
                url: redacted,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Scheme and host of a URL, without path or query
pub fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => match parsed.port() {
                Some(port) => format!("{}://{}:{}/…", parsed.scheme(), host, port),
                None => format!("{}://{}/…", parsed.scheme(), host),
            },
            None => "<invalid url>".to_string(),
        },
        Err(_) => "<invalid url>".to_string(),
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_redact_url_drops_path() {
        assert_eq!(
            redact_url("https://discord.com/api/webhooks/1/secret"),
            "https://discord.com/…"
        );
        assert_eq!(redact_url("http://127.0.0.1:8080/x?token=y"), "http://127.0.0.1:8080/…");
        assert_eq!(redact_url("not a url"), "<invalid url>");
    }

    #[tokio::test]
    async fn test_post_json_sends_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-token", "abc"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new(Duration::from_secs(5)).unwrap();
        client
            .post_json(
                &format!("{}/hook", server.uri()),
                &[("x-token", "abc".to_string())],
                &serde_json::json!({ "a": 1 }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_post_json_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let client = HttpClient::new(Duration::from_secs(5)).unwrap();
        let err = client
            .post_json(&server.uri(), &[], &serde_json::json!({}))
            .await
            .unwrap_err();
        match err {
            HttpClientError::Status { status, body, .. } => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad token");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}

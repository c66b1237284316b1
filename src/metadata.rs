//! Client for the local instance-metadata service.
//!
//! Values are published shortly after the instance boots, so reads made early
//! in a job may come back empty or as `not found` for a while. [`MetadataClient::retry_get`]
//! absorbs that window with a bounded number of attempts.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};

use crate::config::{METADATA_MAX_ATTEMPTS, METADATA_TOKEN_TTL_SECS};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

static TOKEN_PATH: &str = "latest/api/token";
static TOKEN_TTL_HEADER: &str = "X-metadata-token-ttl-seconds";
static TOKEN_HEADER: &str = "X-metadata-token";
static NOT_FOUND_SENTINEL: &str = "not found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataToken {
    pub value: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct MetadataClient {
    client: Client,
    base_url: String,
}

impl MetadataClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::network(&base_url, e))?;
        Ok(Self { client, base_url })
    }

    pub async fn get_token(&self, ttl_seconds: u64) -> Result<MetadataToken> {
        let url = format!("{}/{TOKEN_PATH}", self.base_url);
        let res = self
            .client
            .put(&url)
            .header(TOKEN_TTL_HEADER, ttl_seconds.to_string())
            .send()
            .await
            .map_err(|e| Error::network(&url, e))?;
        let value = success_body(&url, res).await?.trim().to_string();
        Ok(MetadataToken { value, ttl_seconds })
    }

    pub async fn get_value(&self, key: &str, token: &MetadataToken) -> Result<String> {
        let url = format!("{}/{}", self.base_url, key.trim_start_matches('/'));
        let res = self
            .client
            .get(&url)
            .header(TOKEN_HEADER, &token.value)
            .send()
            .await
            .map_err(|e| Error::network(&url, e))?;

        let is_json = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("json"));
        let body = success_body(&url, res).await?;

        if is_json {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
                return Ok(value.to_string());
            }
        }
        Ok(body)
    }

    /// Fetches `key` with a fresh token per attempt, treating empty bodies,
    /// `not found` bodies and transport failures as retryable. Makes exactly
    /// eleven attempts with `sleep` between consecutive ones.
    pub async fn retry_get(&self, key: &str, sleep: Duration) -> Result<String> {
        let policy = RetryPolicy::fixed(METADATA_MAX_ATTEMPTS, sleep);
        policy
            .run(
                |_| async move {
                    let token = self.get_token(METADATA_TOKEN_TTL_SECS).await?;
                    self.get_value(key, &token).await
                },
                |value: &String| value.trim().is_empty() || value.contains(NOT_FOUND_SENTINEL),
            )
            .await
            .map_err(|exhausted| {
                if let Some(e) = &exhausted.last_error {
                    tracing::warn!("last metadata read of `{key}` failed: {e}");
                }
                Error::RetryExhausted {
                    key: key.to_string(),
                    attempts: exhausted.attempts,
                }
            })
    }
}

async fn success_body(url: &str, res: Response) -> Result<String> {
    let status = res.status();
    let body = res.text().await.map_err(|e| Error::network(url, e))?;
    if !status.is_success() {
        return Err(Error::Backend {
            url: url.to_string(),
            status,
            body,
        });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_exchange_sends_ttl_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/latest/api/token")
            .match_header("X-metadata-token-ttl-seconds", "60")
            .with_body("tok-123\n")
            .create_async()
            .await;

        let client = MetadataClient::new(server.url()).unwrap();
        let token = client.get_token(60).await.unwrap();

        assert_eq!(token.value, "tok-123");
        assert_eq!(token.ttl_seconds, 60);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_structured_values_are_stringified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/instance/tags")
            .match_header("X-metadata-token", "tok")
            .with_header("content-type", "application/json")
            .with_body(r#"{ "role": "builder" }"#)
            .create_async()
            .await;
        server
            .mock("GET", "/instance/id")
            .with_body("i-0abc")
            .create_async()
            .await;

        let client = MetadataClient::new(server.url()).unwrap();
        let token = MetadataToken {
            value: "tok".to_string(),
            ttl_seconds: 60,
        };

        let tags = client.get_value("instance/tags", &token).await.unwrap();
        assert_eq!(tags, r#"{"role":"builder"}"#);
        let id = client.get_value("/instance/id", &token).await.unwrap();
        assert_eq!(id, "i-0abc");
    }

    #[tokio::test]
    async fn test_retry_get_gives_up_after_eleven_attempts() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("PUT", "/latest/api/token")
            .with_body("tok")
            .expect(11)
            .create_async()
            .await;
        let value_mock = server
            .mock("GET", "/builder-api-token")
            .with_body("key not found")
            .expect(11)
            .create_async()
            .await;

        let client = MetadataClient::new(server.url()).unwrap();
        let err = client
            .retry_get("builder-api-token", Duration::ZERO)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::RetryExhausted { ref key, attempts: 11 } if key == "builder-api-token"
        ));
        token_mock.assert_async().await;
        value_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_retry_get_returns_published_value() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/latest/api/token")
            .with_body("tok")
            .create_async()
            .await;
        server
            .mock("GET", "/builder-api-token")
            .with_body("secret")
            .expect(1)
            .create_async()
            .await;

        let client = MetadataClient::new(server.url()).unwrap();
        let value = client
            .retry_get("builder-api-token", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(value, "secret");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_a_network_error() {
        // Nothing listens on port 9 of the loopback in CI sandboxes.
        let client = MetadataClient::new("http://127.0.0.1:9").unwrap();
        let err = client.get_token(60).await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }
}

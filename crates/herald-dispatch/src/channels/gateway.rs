//! HTTP client shared by the channel adapters.
//!
//! Every adapter talks to a provider gateway the same way: POST a JSON body
//! with a bearer token and read a JSON reply. Only the payload differs.

use std::time::{Duration, Instant};

use reqwest::Response;
use serde_json::Value;
use tracing::{info_span, Instrument};

use crate::{
    channel::SendOutcome,
    error::{DispatchError, Result},
};

/// Characters of a reply kept in an outcome message.
const MAX_RESPONSE_BODY_SIZE: usize = 1024;

/// Bytes of a reply read off the wire; the rest is never buffered.
const MAX_RESPONSE_READ_BYTES: usize = 64 * 1024;

/// Provider gateway client for one channel.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    channel: &'static str,
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    timeout: Duration,
}

impl GatewayClient {
    /// Builds a client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(
        channel: &'static str,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                DispatchError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { channel, client, api_url: api_url.into(), api_key: api_key.into(), timeout })
    }

    /// Whether both the gateway URL and the API key are set.
    pub fn is_configured(&self) -> bool {
        !self.api_url.trim().is_empty() && !self.api_key.trim().is_empty()
    }

    /// Posts `payload` to the gateway.
    ///
    /// A 2xx reply is a delivered outcome whose message is the provider
    /// message id when the reply carries one. Any other status is a rejected
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Network` when the gateway cannot be reached.
    pub async fn post(&self, payload: &Value) -> Result<SendOutcome> {
        let span = info_span!("gateway_request", channel = self.channel, url = %self.api_url);

        async move {
            let start_time = Instant::now();

            let response = match self
                .client
                .post(&self.api_url)
                .bearer_auth(&self.api_key)
                .json(payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    let duration_ms = start_time.elapsed().as_millis();
                    tracing::warn!(duration_ms, error = %e, "gateway request failed");

                    if e.is_timeout() {
                        let timeout_ms =
                            u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                        return Err(DispatchError::timeout(timeout_ms));
                    }
                    if e.is_connect() {
                        return Err(DispatchError::network(format!("connection failed: {e}")));
                    }
                    return Err(DispatchError::network(e.to_string()));
                },
            };

            let status = response.status().as_u16();
            tracing::debug!(
                status,
                duration_ms = start_time.elapsed().as_millis(),
                "received gateway response"
            );

            Ok(parse_response(response).await)
        }
        .instrument(span)
        .await
    }
}

async fn parse_response(response: Response) -> SendOutcome {
    let status = response.status();
    let body = read_capped(response, MAX_RESPONSE_READ_BYTES).await;
    let json: Option<Value> = serde_json::from_str(&body).ok();

    if status.is_success() {
        let message = json
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(json_text)
            .unwrap_or_else(|| truncate(&body, MAX_RESPONSE_BODY_SIZE));
        return SendOutcome::delivered(message);
    }

    let error_code = json
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(json_text)
        .unwrap_or_else(|| format!("HTTP_{}", status.as_u16()));
    let message = json
        .as_ref()
        .and_then(|v| v.get("message").or_else(|| v.get("error")))
        .and_then(json_text)
        .unwrap_or_else(|| {
            format!("HTTP {}: {}", status.as_u16(), truncate(&body, MAX_RESPONSE_BODY_SIZE))
        });

    SendOutcome::rejected(Some(error_code), message)
}

/// Reads at most `max_bytes` of the body, chunk by chunk.
async fn read_capped(mut response: Response, max_bytes: usize) -> String {
    let mut buffer = Vec::new();

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let remaining = max_bytes - buffer.len();
                if chunk.len() >= remaining {
                    buffer.extend_from_slice(&chunk[..remaining]);
                    tracing::debug!(max_bytes, "gateway response body cut at read limit");
                    break;
                }
                buffer.extend_from_slice(&chunk);
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read gateway response body");
                break;
            },
        }
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Cuts `text` to at most `max_chars` characters.
pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("", 3), "");
    }

    #[test]
    fn missing_key_is_not_configured() {
        let client =
            GatewayClient::new("email", "http://localhost", "", Duration::from_secs(1)).unwrap();
        assert!(!client.is_configured());
    }

    #[tokio::test]
    async fn oversized_reply_is_read_only_up_to_the_limit() {
        use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(200_000)))
            .mount(&server)
            .await;
        let response = reqwest::get(server.uri()).await.unwrap();

        let body = read_capped(response, 16).await;

        assert_eq!(body, "x".repeat(16));
    }

    #[tokio::test]
    async fn short_reply_is_read_whole() {
        use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"id":"m-1"}"#))
            .mount(&server)
            .await;
        let response = reqwest::get(server.uri()).await.unwrap();

        assert_eq!(read_capped(response, MAX_RESPONSE_READ_BYTES).await, r#"{"id":"m-1"}"#);
    }

    #[test]
    fn numeric_ids_are_accepted() {
        assert_eq!(json_text(&serde_json::json!(42)), Some("42".to_string()));
        assert_eq!(json_text(&serde_json::json!({"a": 1})), None);
    }
}

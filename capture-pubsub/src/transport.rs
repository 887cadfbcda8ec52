use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubsubMessage {
    /// Base64 encoded payload.
    pub data: String,
}

impl PubsubMessage {
    pub fn from_payload(payload: &[u8]) -> PubsubMessage {
        PubsubMessage {
            data: base64::engine::general_purpose::STANDARD.encode(payload),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub messages: Vec<PubsubMessage>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    #[serde(rename = "messageIds", default)]
    pub message_ids: Vec<String>,
}

/// Outcome of a single failed call to the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("authorization token was refused: {0}")]
    Unauthorized(String),
    #[error("transient broker error: {0}")]
    Transient(String),
    #[error("attempt timed out")]
    Timeout,
    #[error("broker rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl TransportError {
    /// Build the error matching a non-success response status.
    pub fn from_status(status: StatusCode, message: String) -> TransportError {
        if status == StatusCode::UNAUTHORIZED {
            TransportError::Unauthorized(message)
        } else if is_retryable_status(status) {
            TransportError::Transient(format!("{}: {}", status, message))
        } else {
            TransportError::Rejected {
                status: status.as_u16(),
                message,
            }
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// The broker's publish call, as seen from the client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        request: &PublishRequest,
        token: &str,
    ) -> Result<PublishResponse, TransportError>;
}

/// Pub/Sub REST transport.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str, client: reqwest::Client) -> HttpTransport {
        HttpTransport {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn publish_url(&self, topic: &str) -> String {
        format!("{}/v1/{}:publish", self.endpoint, topic)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn publish(
        &self,
        topic: &str,
        request: &PublishRequest,
        token: &str,
    ) -> Result<PublishResponse, TransportError> {
        let response = self
            .client
            .post(self.publish_url(topic))
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, message));
        }

        response
            .json::<PublishResponse>()
            .await
            .map_err(|e| TransportError::Transient(format!("invalid publish response: {}", e)))
    }
}

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::api::{ConfigurationError, DeliveryError, ProcessorError};
use crate::credentials::{Credential, ServiceAccountTokenSource, TokenCache, TokenSource};
use crate::retry::RetryPolicy;
use crate::transport::{
    HttpTransport, PublishRequest, PublishResponse, Transport, TransportError,
    DEFAULT_PUBSUB_ENDPOINT,
};

const USER_AGENT: &str = concat!("capture-pubsub/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub endpoint: String,
    pub retry_policy: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            endpoint: DEFAULT_PUBSUB_ENDPOINT.to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Authenticated handle to the broker, shared by every publish call.
///
/// Each call goes through the retry policy: a refused token is renewed and the
/// call repeated right away, transient failures are retried with backoff until
/// the attempt budget runs out.
pub struct BrokerClient {
    transport: Arc<dyn Transport>,
    tokens: TokenCache,
    retry_policy: RetryPolicy,
}

impl BrokerClient {
    /// Wrap a transport and a token source. Fetches a first token, so an
    /// unusable credential is reported here rather than on the first publish.
    pub async fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenSource>,
        retry_policy: RetryPolicy,
    ) -> Result<BrokerClient, ProcessorError> {
        let tokens = TokenCache::new(tokens).await?;
        Ok(BrokerClient {
            transport,
            tokens,
            retry_policy,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub async fn publish(
        &self,
        topic: &str,
        request: &PublishRequest,
    ) -> Result<PublishResponse, DeliveryError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let token = match self.tokens.token().await {
                Ok(token) => token,
                Err(e) if e.is_transient() && self.retry_policy.should_retry(attempt) => {
                    self.backoff(attempt, "token").await;
                    continue;
                }
                Err(e) => return Err(DeliveryError::Authorization(e)),
            };

            let result = tokio::time::timeout(
                self.retry_policy.attempt_timeout(),
                self.transport.publish(topic, request, token.value()),
            )
            .await
            .unwrap_or(Err(TransportError::Timeout));

            let error = match result {
                Ok(response) => return Ok(response),
                Err(TransportError::Rejected { status, message }) => {
                    return Err(DeliveryError::Rejected { status, message })
                }
                Err(error) => error,
            };

            if !self.retry_policy.should_retry(attempt) {
                return Err(DeliveryError::RetriesExhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            match error {
                TransportError::Unauthorized(ref reason) => {
                    warn!(attempt, "publish token refused, refreshing: {}", reason);
                    metrics::counter!(
                        "capture_pubsub_publish_retries_total",
                        "cause" => "unauthorized"
                    )
                    .increment(1);
                    match self.tokens.refresh(&token).await {
                        Ok(_) => {}
                        Err(e) if e.is_transient() => {
                            warn!(attempt, "token refresh failed: {}", e);
                            self.backoff(attempt, "token").await;
                        }
                        Err(e) => return Err(DeliveryError::Authorization(e)),
                    }
                }
                _ => {
                    warn!(attempt, "publish attempt failed: {}", error);
                    self.backoff(attempt, "transient").await;
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32, cause: &'static str) {
        metrics::counter!("capture_pubsub_publish_retries_total", "cause" => cause).increment(1);
        tokio::time::sleep(self.retry_policy.time_until_next_retry(attempt - 1)).await;
    }
}

/// Build a client from a service-account key file.
///
/// The credential is scoped with `scopes` when it carries none, and a first
/// token is requested before the client is handed out.
pub async fn build_client(
    secret_path: &Path,
    scopes: &[&str],
    options: ClientOptions,
) -> Result<BrokerClient, ProcessorError> {
    let mut credential = Credential::from_file(secret_path)?;
    if credential.requires_scoping() {
        credential = credential.scoped(scopes);
    }
    info!(
        "loaded credential for {} from {}",
        credential.client_email(),
        secret_path.display()
    );

    let http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(options.retry_policy.attempt_timeout())
        .build()
        .map_err(ConfigurationError::HttpClient)?;

    let tokens = ServiceAccountTokenSource::new(&credential, http.clone())?;
    let transport = HttpTransport::new(&options.endpoint, http);

    let client =
        BrokerClient::new(Arc::new(transport), Arc::new(tokens), options.retry_policy).await?;
    info!("connected to broker at {}", options.endpoint);
    Ok(client)
}

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use time::macros::datetime;

use capture_pubsub::api::{AuthorizationError, ProcessorError};
use capture_pubsub::client::BrokerClient;
use capture_pubsub::credentials::{AccessToken, TokenSource};
use capture_pubsub::event::TrackedEvent;
use capture_pubsub::processor::ClientFactory;
use capture_pubsub::retry::RetryPolicy;
use capture_pubsub::transport::{PublishRequest, PublishResponse, Transport, TransportError};

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub topic: String,
    pub request: PublishRequest,
    pub token: String,
}

impl RecordedCall {
    /// The decoded payload of the single message in the call.
    pub fn payload(&self) -> String {
        assert_eq!(self.request.messages.len(), 1);
        let bytes = STANDARD
            .decode(&self.request.messages[0].data)
            .expect("payload is not base64");
        String::from_utf8(bytes).expect("payload is not utf-8")
    }
}

/// Answers publish calls from a script, then succeeds with id "0" once the
/// script is used up. Every call is recorded.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<PublishResponse, TransportError>>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<PublishResponse, TransportError>>) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    /// Every call sleeps for `delay` before answering.
    pub fn hanging(delay: Duration) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn publish(
        &self,
        topic: &str,
        request: &PublishRequest,
        token: &str,
    ) -> Result<PublishResponse, TransportError> {
        self.calls.lock().unwrap().push(RecordedCall {
            topic: topic.to_string(),
            request: request.clone(),
            token: token.to_string(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(accepted(&["0"])))
    }
}

/// Hands out "token-1", "token-2", ... one per fetch.
#[derive(Default)]
pub struct SequentialTokens {
    fetches: AtomicUsize,
    rejected_from: Option<usize>,
    unavailable_on: Option<usize>,
}

impl SequentialTokens {
    pub fn new() -> Arc<SequentialTokens> {
        Arc::new(SequentialTokens::default())
    }

    pub fn failing() -> Arc<SequentialTokens> {
        SequentialTokens::rejected_from(1)
    }

    /// The `fetch`-th fetch (one-based) and every later one are refused.
    pub fn rejected_from(fetch: usize) -> Arc<SequentialTokens> {
        Arc::new(SequentialTokens {
            rejected_from: Some(fetch),
            ..Default::default()
        })
    }

    /// The `fetch`-th fetch (one-based) finds the token endpoint unreachable.
    pub fn unavailable_on(fetch: usize) -> Arc<SequentialTokens> {
        Arc::new(SequentialTokens {
            unavailable_on: Some(fetch),
            ..Default::default()
        })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for SequentialTokens {
    async fn fetch_token(&self) -> Result<AccessToken, AuthorizationError> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.rejected_from.is_some_and(|from| fetch >= from) {
            return Err(AuthorizationError::TokenRejected {
                status: 400,
                message: "invalid_grant".to_string(),
            });
        }
        if self.unavailable_on == Some(fetch) {
            return Err(AuthorizationError::TokenUnavailable(
                "connection reset".to_string(),
            ));
        }
        Ok(AccessToken::new(format!("token-{}", fetch), None))
    }
}

/// Builds clients on top of a scripted transport, remembering the requested
/// secret paths and scopes.
pub struct ScriptedFactory {
    pub transport: Arc<ScriptedTransport>,
    pub tokens: Arc<SequentialTokens>,
    pub retry_policy: RetryPolicy,
    pub builds: Mutex<Vec<(PathBuf, Vec<String>)>>,
}

impl ScriptedFactory {
    pub fn new(transport: Arc<ScriptedTransport>) -> ScriptedFactory {
        ScriptedFactory::with_tokens(transport, SequentialTokens::new())
    }

    pub fn with_tokens(
        transport: Arc<ScriptedTransport>,
        tokens: Arc<SequentialTokens>,
    ) -> ScriptedFactory {
        ScriptedFactory {
            transport,
            tokens,
            retry_policy: fast_retries(3),
            builds: Mutex::new(Vec::new()),
        }
    }

    pub fn builds(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.builds.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientFactory for ScriptedFactory {
    async fn build(
        &self,
        secret_path: &Path,
        scopes: &[&str],
    ) -> Result<BrokerClient, ProcessorError> {
        self.builds.lock().unwrap().push((
            secret_path.to_path_buf(),
            scopes.iter().map(|s| s.to_string()).collect(),
        ));
        BrokerClient::new(
            self.transport.clone(),
            self.tokens.clone(),
            self.retry_policy,
        )
        .await
    }
}

pub fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::build(2, Duration::from_millis(1))
        .maximum_interval(Duration::from_millis(5))
        .max_attempts(max_attempts)
        .attempt_timeout(Duration::from_secs(5))
        .provide()
}

pub fn accepted(ids: &[&str]) -> PublishResponse {
    PublishResponse {
        message_ids: ids.iter().map(|id| id.to_string()).collect(),
    }
}

pub fn transient() -> Result<PublishResponse, TransportError> {
    Err(TransportError::Transient("503 Service Unavailable".to_string()))
}

pub fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn processor_params() -> HashMap<String, String> {
    params(&[
        ("projectName", "capture-test"),
        ("topicName", "events"),
        ("secretPath", "/etc/capture/key.json"),
        ("inlinedVisitorParams", "plan"),
    ])
}

pub fn sample_event() -> TrackedEvent {
    TrackedEvent {
        server_ts: datetime!(2024-03-01 10:15:30.25 UTC),
        client_ts: Some(datetime!(2024-03-01 10:15:29.001 UTC)),
        client_addr: "10.0.0.1".to_string(),
        visitor_id: "v1".to_string(),
        session_id: "s1".to_string(),
        global_visitor_id: Some("g1".to_string()),
        page: Some("https://example.com/pricing".to_string()),
        referer: None,
        user_agent: Some("Mozilla/5.0".to_string()),
        event_type: Some("page".to_string()),
        visitor_params: Some("plan=pro&country=fr".to_string()),
        session_params: None,
        event_params: Some("button=signup".to_string()),
        browser_width: 1280,
        browser_height: 720,
        screen_width: 1920,
        screen_height: 1080,
        browser_language: Some("fr-FR".to_string()),
        tz_offset: Some("-60".to_string()),
    }
}

//! Service-account credentials and the access tokens minted from them.
//!
//! Credentials are only ever loaded from a local key file. Tokens are obtained
//! with the OAuth2 JWT-bearer grant and cached in a `TokenCache`, which is
//! shared by every publish call.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::api::{AuthorizationError, ConfigurationError};

/// Scopes needed to publish, as granted to Pub/Sub clients.
pub const PUBSUB_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/pubsub",
    "https://www.googleapis.com/auth/cloud-platform",
];

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECONDS: i64 = 3600;
/// Tokens this close to their expiry are renewed before use.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Clone, Deserialize)]
struct ServiceAccountKey {
    #[serde(rename = "type")]
    key_type: String,
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

/// A service-account credential, possibly not yet scoped.
#[derive(Clone)]
pub struct Credential {
    key: ServiceAccountKey,
    scopes: Vec<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("client_email", &self.key.client_email)
            .field("token_uri", &self.key.token_uri)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

impl Credential {
    pub fn from_file(path: &Path) -> Result<Credential, ConfigurationError> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| ConfigurationError::UnreadableSecret {
                path: path.to_path_buf(),
                source,
            })?;
        Credential::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Credential, ConfigurationError> {
        let key: ServiceAccountKey = serde_json::from_str(contents)
            .map_err(|e| ConfigurationError::InvalidCredential(e.to_string()))?;

        if key.key_type != "service_account" {
            return Err(ConfigurationError::InvalidCredential(format!(
                "unsupported credential type {:?}",
                key.key_type
            )));
        }
        if key.client_email.is_empty() || key.private_key.is_empty() {
            return Err(ConfigurationError::InvalidCredential(
                "client_email and private_key must be set".to_string(),
            ));
        }

        Ok(Credential {
            key,
            scopes: Vec::new(),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Key files carry no scope, one has to be requested before use.
    pub fn requires_scoping(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn scoped(mut self, scopes: &[&str]) -> Credential {
        self.scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_token_uri(mut self, token_uri: &str) -> Credential {
        self.key.token_uri = token_uri.to_string();
        self
    }
}

/// A bearer token and the instant it stops being valid, if known.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    expires_at: Option<Instant>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_in: Option<Duration>) -> AccessToken {
        AccessToken {
            value: value.into(),
            expires_at: expires_in.map(|lifetime| Instant::now() + lifetime),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_expiring(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => now + EXPIRY_MARGIN >= expires_at,
            None => false,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<AccessToken, AuthorizationError>;
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Mints access tokens for a scoped service-account credential.
pub struct ServiceAccountTokenSource {
    client: reqwest::Client,
    client_email: String,
    token_uri: String,
    scope: String,
    header: Header,
    signing_key: EncodingKey,
}

impl ServiceAccountTokenSource {
    pub fn new(
        credential: &Credential,
        client: reqwest::Client,
    ) -> Result<ServiceAccountTokenSource, AuthorizationError> {
        if credential.requires_scoping() {
            return Err(AuthorizationError::NoScopes);
        }

        let signing_key = EncodingKey::from_rsa_pem(credential.key.private_key.as_bytes())?;
        let mut header = Header::new(Algorithm::RS256);
        header.kid = credential.key.private_key_id.clone();

        Ok(ServiceAccountTokenSource {
            client,
            client_email: credential.key.client_email.clone(),
            token_uri: credential.key.token_uri.clone(),
            scope: credential.scopes.join(" "),
            header,
            signing_key,
        })
    }

    fn assertion(&self) -> Result<String, AuthorizationError> {
        let iat = time::OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            iss: &self.client_email,
            scope: &self.scope,
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECONDS,
        };
        Ok(jsonwebtoken::encode(
            &self.header,
            &claims,
            &self.signing_key,
        )?)
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn fetch_token(&self) -> Result<AccessToken, AuthorizationError> {
        let assertion = self.assertion()?;
        debug!("requesting access token from {}", self.token_uri);

        let response = self
            .client
            .post(&self.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| AuthorizationError::TokenUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AuthorizationError::TokenRejected {
                status: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            AuthorizationError::TokenUnavailable(format!("invalid token response: {}", e))
        })?;

        Ok(AccessToken::new(
            token.access_token,
            token.expires_in.map(Duration::from_secs),
        ))
    }
}

/// Holds the current access token. Renewals are serialized, reads are not.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    current: RwLock<Arc<AccessToken>>,
    refresh_lock: Mutex<()>,
}

impl TokenCache {
    /// Fetch a first token, so an unusable credential fails right away.
    pub async fn new(source: Arc<dyn TokenSource>) -> Result<TokenCache, AuthorizationError> {
        let token = source.fetch_token().await?;
        info!("obtained initial access token");

        Ok(TokenCache {
            source,
            current: RwLock::new(Arc::new(token)),
            refresh_lock: Mutex::new(()),
        })
    }

    /// The current token, renewed first if it is about to expire. A failed
    /// renewal falls back to the current token while it is still valid.
    pub async fn token(&self) -> Result<Arc<AccessToken>, AuthorizationError> {
        let token = self.current.read().await.clone();
        if !token.is_expiring(Instant::now()) {
            return Ok(token);
        }

        match self.refresh(&token).await {
            Ok(fresh) => Ok(fresh),
            Err(e) if !token.is_expired(Instant::now()) => {
                warn!("failed to renew expiring access token, keeping it: {}", e);
                Ok(token)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace `stale` with a fresh token. When another caller already
    /// replaced it, that token is returned without asking the source again.
    pub async fn refresh(
        &self,
        stale: &Arc<AccessToken>,
    ) -> Result<Arc<AccessToken>, AuthorizationError> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.current.read().await.clone();
        if !Arc::ptr_eq(&current, stale) && !current.is_expiring(Instant::now()) {
            return Ok(current);
        }

        let fresh = Arc::new(self.source.fetch_token().await?);
        metrics::counter!("capture_pubsub_token_refreshes_total").increment(1);
        debug!("access token refreshed");

        *self.current.write().await = fresh.clone();
        Ok(fresh)
    }
}

use std::io;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::processor::ProcessorState;
use crate::transport::TransportError;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ProcessResponseCode {
    Ok = 1,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProcessResponse {
    pub status: ProcessResponseCode,
    pub message_ids: Vec<String>,
}

/// Static configuration problems. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("missing configuration parameter {0}")]
    MissingParameter(&'static str),
    #[error("invalid value {value:?} for configuration parameter {key}")]
    InvalidParameter { key: &'static str, value: String },
    #[error("failed to read secret file {path}: {source}")]
    UnreadableSecret {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("secret file does not hold a valid credential: {0}")]
    InvalidCredential(String),
    #[error("{kind} name {name:?} cannot be used in a resource name")]
    InvalidResourceName { kind: &'static str, name: String },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// The credential could not be turned into a usable access token.
#[derive(Error, Debug)]
pub enum AuthorizationError {
    #[error("credential private key is not usable: {0}")]
    InvalidKey(#[from] jsonwebtoken::errors::Error),
    #[error("credential has no scope to request")]
    NoScopes,
    #[error("token endpoint rejected the credential ({status}): {message}")]
    TokenRejected { status: u16, message: String },
    #[error("token endpoint could not be reached: {0}")]
    TokenUnavailable(String),
}

impl AuthorizationError {
    /// Whether asking the token endpoint again could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthorizationError::TokenUnavailable(_) => true,
            AuthorizationError::TokenRejected { status, .. } => {
                *status == 429 || (500..600).contains(status)
            }
            AuthorizationError::InvalidKey(_) | AuthorizationError::NoScopes => false,
        }
    }
}

/// A single event could not be delivered to the broker.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("broker rejected the publish call ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("publish failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },
    #[error("could not renew authorization while publishing: {0}")]
    Authorization(#[from] AuthorizationError),
}

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error("operation not allowed while the processor is {0:?}")]
    InvalidState(ProcessorState),
}

impl IntoResponse for ProcessorError {
    fn into_response(self) -> Response {
        match self {
            ProcessorError::Configuration(_) | ProcessorError::Authorization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }

            ProcessorError::Delivery(DeliveryError::Rejected { .. }) => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }

            ProcessorError::Delivery(_) | ProcessorError::InvalidState(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
        }
        .into_response()
    }
}

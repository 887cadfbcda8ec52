use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::api::ConfigurationError;
use crate::client::ClientOptions;
use crate::format::EscapeMode;
use crate::inline::{InlineRuleSet, InlineRules};
use crate::retry::RetryPolicy;

pub const PROJECT_PARAM: &str = "projectName";
pub const TOPIC_PARAM: &str = "topicName";
pub const SECRET_PARAM: &str = "secretPath";
pub const INLINED_VISITOR_PARAMS: &str = "inlinedVisitorParams";
pub const INLINED_SESSION_PARAMS: &str = "inlinedSessionParams";
pub const INLINED_EVENT_PARAMS: &str = "inlinedEventParams";
pub const STRICT_ESCAPING_PARAM: &str = "strictEscaping";

/// Validated processor parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessorConfig {
    pub project_name: String,
    pub topic_name: String,
    pub secret_path: PathBuf,
    pub inline_rules: InlineRuleSet,
    pub escape_mode: EscapeMode,
}

fn required(
    params: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, ConfigurationError> {
    params
        .get(key)
        .cloned()
        .ok_or(ConfigurationError::MissingParameter(key))
}

impl ProcessorConfig {
    /// Required keys are checked in order, the first missing one is reported.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, ConfigurationError> {
        let project_name = required(params, PROJECT_PARAM)?;
        let topic_name = required(params, TOPIC_PARAM)?;
        let secret_path = PathBuf::from(required(params, SECRET_PARAM)?);

        let inline_rules = InlineRuleSet {
            visitor: InlineRules::from_csv(params.get(INLINED_VISITOR_PARAMS).map(String::as_str)),
            session: InlineRules::from_csv(params.get(INLINED_SESSION_PARAMS).map(String::as_str)),
            event: InlineRules::from_csv(params.get(INLINED_EVENT_PARAMS).map(String::as_str)),
        };

        let escape_mode = match params.get(STRICT_ESCAPING_PARAM) {
            None => EscapeMode::QuoteComma,
            Some(value) => match value.trim().parse::<bool>() {
                Ok(true) => EscapeMode::Json,
                Ok(false) => EscapeMode::QuoteComma,
                Err(_) => {
                    return Err(ConfigurationError::InvalidParameter {
                        key: STRICT_ESCAPING_PARAM,
                        value: value.clone(),
                    })
                }
            },
        };

        Ok(ProcessorConfig {
            project_name,
            topic_name,
            secret_path,
            inline_rules,
            escape_mode,
        })
    }
}

/// Process configuration of the server, read from the environment.
#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    pub project_name: Option<String>,
    pub topic_name: Option<String>,
    pub secret_path: Option<String>,

    pub inlined_visitor_params: Option<String>,
    pub inlined_session_params: Option<String>,
    pub inlined_event_params: Option<String>,

    #[envconfig(default = "false")]
    pub strict_escaping: bool,

    #[envconfig(default = "false")]
    pub third_party_cookies: bool,

    #[envconfig(default = "https://pubsub.googleapis.com")]
    pub pubsub_endpoint: String,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// The processor parameters, keyed the way `ProcessorConfig` expects them.
    pub fn processor_params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        let optional = [
            (PROJECT_PARAM, &self.project_name),
            (TOPIC_PARAM, &self.topic_name),
            (SECRET_PARAM, &self.secret_path),
            (INLINED_VISITOR_PARAMS, &self.inlined_visitor_params),
            (INLINED_SESSION_PARAMS, &self.inlined_session_params),
            (INLINED_EVENT_PARAMS, &self.inlined_event_params),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                params.insert(key.to_string(), value.clone());
            }
        }
        params.insert(
            STRICT_ESCAPING_PARAM.to_string(),
            self.strict_escaping.to_string(),
        );
        params
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            endpoint: self.pubsub_endpoint.clone(),
            retry_policy: self.retry_policy.provide(),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "5")]
    pub max_attempts: u32,

    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "250")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "8000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub request_timeout: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::build(self.backoff_coefficient, self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .max_attempts(self.max_attempts)
            .attempt_timeout(self.request_timeout.0)
            .provide()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

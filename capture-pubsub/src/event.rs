use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One tracked request, as handed over by the tracking frontend.
///
/// The three `*_params` fields are raw URL-encoded blobs. They are forwarded
/// verbatim and can also have some of their keys inlined in the record.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TrackedEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub server_ts: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub client_ts: Option<OffsetDateTime>,
    pub client_addr: String,
    pub visitor_id: String,
    pub session_id: String,
    #[serde(default)]
    pub global_visitor_id: Option<String>,
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub visitor_params: Option<String>,
    #[serde(default)]
    pub session_params: Option<String>,
    #[serde(default)]
    pub event_params: Option<String>,
    #[serde(default)]
    pub browser_width: u32,
    #[serde(default)]
    pub browser_height: u32,
    #[serde(default)]
    pub screen_width: u32,
    #[serde(default)]
    pub screen_height: u32,
    #[serde(default)]
    pub browser_language: Option<String>,
    #[serde(default)]
    pub tz_offset: Option<String>,
}

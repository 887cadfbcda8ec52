//! Line-oriented record format for tracked events.
//!
//! A record is a single line of brace-delimited `key:"value"` pairs:
//!
//! ```text
//! { server_ts:"2024-03-01T10:15:30.250", client_ts:"...", ..., tz_offset:"-60", utm_source="mail", }
//! ```
//!
//! Fixed fields use `key:"value"`, inlined parameters use `key="value"`. This
//! is not JSON: keys are bare, every field is followed by `", ` and values are
//! only defused against the `",` sequence, so consumers need a tolerant
//! key-value scanner.
//!
//! With third-party cookies enabled, `global_visitor_id="..."` follows the
//! fixed fields. Older producers wrote it with a bare `",` trailer and an
//! unescaped value; here it gets the same `", ` trailer and escaping as every
//! other field, so a forged id cannot split the record.

use std::borrow::Cow;
use std::fmt;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::event::TrackedEvent;
use crate::inline::{inline, InlineRuleSet, InlineRules};

const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]");

/// Rendering of absent values.
const NULL: &str = "null";

/// How values are defused before being written between quotes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EscapeMode {
    /// Replace the `",` sequence with `\"`. Bare quotes and backslashes are
    /// left alone, so a value can still break out of its field.
    #[default]
    QuoteComma,
    /// Escape values as JSON string contents.
    Json,
}

impl EscapeMode {
    pub fn escape<'a>(&self, value: &'a str) -> Cow<'a, str> {
        match self {
            EscapeMode::QuoteComma => {
                if !value.contains("\",") {
                    return Cow::Borrowed(value);
                }
                // A replacement followed by a comma forms the sequence again,
                // each pass drops one comma.
                let mut escaped = value.replace("\",", "\\\"");
                while escaped.contains("\",") {
                    escaped = escaped.replace("\",", "\\\"");
                }
                Cow::Owned(escaped)
            }
            EscapeMode::Json => {
                if !value
                    .chars()
                    .any(|c| c == '"' || c == '\\' || c.is_control())
                {
                    return Cow::Borrowed(value);
                }
                let quoted = serde_json::Value::String(value.to_owned()).to_string();
                Cow::Owned(quoted[1..quoted.len() - 1].to_owned())
            }
        }
    }
}

/// The rendered form of one event. Single line, no terminator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormattedRecord(String);

impl FormattedRecord {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for FormattedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Appends fields to a record in call order. All escaping goes through the
/// builder's `EscapeMode`.
pub struct RecordBuilder {
    buf: String,
    escape: EscapeMode,
}

impl RecordBuilder {
    pub fn new(escape: EscapeMode, capacity: usize) -> Self {
        let mut buf = String::with_capacity(capacity);
        buf.push_str("{ ");
        RecordBuilder { buf, escape }
    }

    fn push(&mut self, name: &str, assign: char, value: &str) {
        self.buf.push_str(name);
        self.buf.push(assign);
        self.buf.push('"');
        self.buf.push_str(value);
        self.buf.push_str("\", ");
    }

    /// A fixed field whose value is written as-is. `None` renders as `null`.
    pub fn field(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        self.push(name, ':', value.unwrap_or(NULL));
        self
    }

    /// A fixed field whose value goes through the escape function.
    pub fn escaped_field(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        let escape = self.escape;
        match value {
            Some(value) => self.push(name, ':', &escape.escape(value)),
            None => self.push(name, ':', NULL),
        }
        self
    }

    pub fn timestamp_field(&mut self, name: &str, value: Option<OffsetDateTime>) -> &mut Self {
        let rendered = value.and_then(|ts| {
            ts.to_offset(UtcOffset::UTC)
                .format(TIMESTAMP_FORMAT)
                .ok()
        });
        self.field(name, rendered.as_deref())
    }

    pub fn number_field(&mut self, name: &str, value: u32) -> &mut Self {
        self.push(name, ':', &value.to_string());
        self
    }

    /// A field lifted out of a parameter blob, written as `name="value"`.
    pub fn inlined_field(&mut self, name: &str, value: &str) -> &mut Self {
        let escape = self.escape;
        self.push(name, '=', &escape.escape(value));
        self
    }

    pub fn finish(mut self) -> FormattedRecord {
        self.buf.push('}');
        FormattedRecord(self.buf)
    }
}

/// Renders tracked events with a fixed field layout, plus the configured
/// inlined parameters.
#[derive(Clone, Debug)]
pub struct EventFormatter {
    rules: InlineRuleSet,
    third_party_cookies: bool,
    escape: EscapeMode,
}

impl EventFormatter {
    pub fn new(rules: InlineRuleSet, third_party_cookies: bool) -> Self {
        EventFormatter {
            rules,
            third_party_cookies,
            escape: EscapeMode::default(),
        }
    }

    pub fn with_escape_mode(mut self, escape: EscapeMode) -> Self {
        self.escape = escape;
        self
    }

    pub fn format(&self, event: &TrackedEvent) -> FormattedRecord {
        let blobs_len = [
            &event.visitor_params,
            &event.session_params,
            &event.event_params,
        ]
        .iter()
        .map(|blob| blob.as_ref().map_or(0, String::len))
        .sum::<usize>();

        let mut record = RecordBuilder::new(self.escape, 512 + 2 * blobs_len);
        record
            .timestamp_field("server_ts", Some(event.server_ts))
            .timestamp_field("client_ts", event.client_ts)
            .field("client_addr", Some(event.client_addr.as_str()))
            .field("visitor_id", Some(event.visitor_id.as_str()))
            .field("session_id", Some(event.session_id.as_str()))
            .escaped_field("location", event.page.as_deref())
            .escaped_field("referer", event.referer.as_deref())
            .escaped_field("user-agent", event.user_agent.as_deref())
            .escaped_field("type", event.event_type.as_deref())
            .escaped_field("visitor_params", event.visitor_params.as_deref())
            .escaped_field("session_params", event.session_params.as_deref())
            .escaped_field("event_params", event.event_params.as_deref())
            .number_field("browser_width", event.browser_width)
            .number_field("browser_height", event.browser_height)
            .number_field("screen_width", event.screen_width)
            .number_field("screen_height", event.screen_height)
            .field("browser_language", event.browser_language.as_deref())
            .field("tz_offset", event.tz_offset.as_deref());

        if self.third_party_cookies {
            record.inlined_field(
                "global_visitor_id",
                event.global_visitor_id.as_deref().unwrap_or(NULL),
            );
        }

        append_inlined(&mut record, event.visitor_params.as_deref(), &self.rules.visitor);
        append_inlined(&mut record, event.session_params.as_deref(), &self.rules.session);
        append_inlined(&mut record, event.event_params.as_deref(), &self.rules.event);

        record.finish()
    }
}

fn append_inlined(record: &mut RecordBuilder, blob: Option<&str>, rules: &InlineRules) {
    let Some(blob) = blob else {
        return;
    };
    if rules.is_empty() {
        return;
    }
    for (name, value) in inline(blob, rules) {
        record.inlined_field(&name, &value);
    }
}

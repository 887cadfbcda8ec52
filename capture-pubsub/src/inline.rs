//! Lifting selected keys out of URL-encoded parameter blobs.

use std::collections::HashMap;

use tracing::debug;

/// An ordered set of parameter names to inline.
///
/// Names keep the order they were configured in, so rendering is
/// deterministic for a given configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InlineRules(Vec<String>);

impl InlineRules {
    /// Parse a comma-separated list of names. Entries are trimmed, empty
    /// entries are skipped and only the first occurrence of a name is kept.
    pub fn from_csv(csv: Option<&str>) -> Self {
        let mut names: Vec<String> = Vec::new();
        for name in csv.unwrap_or_default().split(',').map(str::trim) {
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_owned());
            }
        }
        InlineRules(names)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for InlineRules {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut rules = InlineRules::default();
        for name in iter {
            let name = name.into();
            if !rules.contains(&name) {
                rules.0.push(name);
            }
        }
        rules
    }
}

/// The three rule sets, one per parameter blob of a tracked event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InlineRuleSet {
    pub visitor: InlineRules,
    pub session: InlineRules,
    pub event: InlineRules,
}

/// Decode a query string into key -> values, keeping repeated keys.
///
/// Never fails: a blob that cannot be decoded yields no keys at all.
fn decode_query_string(blob: &str) -> HashMap<String, Vec<String>> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(blob).unwrap_or_else(|e| {
        debug!("ignoring undecodable parameter blob: {}", e);
        Vec::new()
    });

    let mut decoded: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in pairs {
        decoded.entry(key).or_default().push(value);
    }
    decoded
}

/// Extract the configured keys from `blob`, in rule order.
///
/// Keys missing from the blob map to an empty value. When a key repeats,
/// only its first value is used. Values are returned raw, escaping is up
/// to the caller.
pub fn inline(blob: &str, rules: &InlineRules) -> Vec<(String, String)> {
    let mut decoded = decode_query_string(blob);

    rules
        .iter()
        .map(|name| {
            let value = decoded
                .remove(name)
                .and_then(|values| values.into_iter().next())
                .unwrap_or_default();
            (name.to_owned(), value)
        })
        .collect()
}

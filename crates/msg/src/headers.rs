//! Reserved header vocabulary and the [`Headers`] map.
//!
//! Header names are part of the wire contract and must be preserved verbatim
//! by every producer and consumer that interoperates with these services.

use std::collections::HashMap;

use crate::{MsgError, Result};

pub const MESSAGE_COMMAND_PREFIX: &str = "command-";
pub const MESSAGE_COMMAND_NAME: &str = "command-name";
pub const MESSAGE_COMMAND_REPLY_CHANNEL: &str = "command-reply-channel";

pub const MESSAGE_EVENT_PREFIX: &str = "event-";
pub const MESSAGE_EVENT_NAME: &str = "event-name";
pub const MESSAGE_EVENT_ENTITY_NAME: &str = "event-entity-name";
pub const MESSAGE_EVENT_ENTITY_ID: &str = "event-entity-id";

pub const MESSAGE_REPLY_PREFIX: &str = "reply-";
pub const MESSAGE_REPLY_NAME: &str = "reply-name";
pub const MESSAGE_REPLY_OUTCOME: &str = "reply-outcome";

pub const MESSAGE_CORRELATION_ID: &str = "correlation-id";
pub const MESSAGE_CAUSATION_ID: &str = "causation-id";
pub const MESSAGE_DESTINATION_CHANNEL: &str = "destination-channel";
pub const MESSAGE_DATE: &str = "date";

pub const REPLY_OUTCOME_SUCCESS: &str = "SUCCESS";
pub const REPLY_OUTCOME_FAILURE: &str = "FAILURE";

/// String-keyed message metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, or an empty string when absent.
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or_default()
    }

    /// Returns the value for `key`, failing with [`MsgError::MissingHeader`]
    /// when absent.
    pub fn get_required(&self, key: &str) -> Result<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| MsgError::MissingHeader(key.to_string()))
    }

    /// Sets a header, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Sets a header only when it is absent or empty.
    pub fn insert_if_empty(&mut self, key: &str, value: impl Into<String>) {
        if self.get(key).is_empty() {
            self.0.insert(key.to_string(), value.into());
        }
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Copies every entry of `other` into this map, overwriting duplicates.
    pub fn merge(&mut self, other: &Headers) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Iterates over all entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, String>> for Headers {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Headers {
    fn from(entries: [(K, V); N]) -> Self {
        entries.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

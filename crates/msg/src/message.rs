use uuid::Uuid;

use crate::Headers;
use crate::headers::MESSAGE_DESTINATION_CHANNEL;

/// The wire envelope: an opaque id, string metadata and a serialized payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: String,
    headers: Headers,
    payload: Vec<u8>,
}

impl Message {
    /// Creates a message with a freshly generated id and no headers.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            headers: Headers::new(),
            payload,
        }
    }

    /// Rebuilds a message received from a transport.
    pub fn from_parts(id: impl Into<String>, headers: Headers, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            headers,
            payload,
        }
    }

    /// Merges `headers` into the message headers.
    pub fn with_headers(mut self, headers: &Headers) -> Self {
        self.headers.merge(headers);
        self
    }

    /// Sets the channel the message is published to.
    pub fn with_destination_channel(mut self, channel: impl Into<String>) -> Self {
        self.headers.insert(MESSAGE_DESTINATION_CHANNEL, channel);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_messages_get_unique_ids() {
        let a = Message::new(vec![]);
        let b = Message::new(vec![]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_builder_applies_headers_then_channel() {
        let message = Message::new(b"{}".to_vec())
            .with_headers(&Headers::from([
                ("x-tenant", "acme"),
                (MESSAGE_DESTINATION_CHANNEL, "ignored"),
            ]))
            .with_destination_channel("orders");

        assert_eq!(message.headers().get("x-tenant"), "acme");
        assert_eq!(message.headers().get(MESSAGE_DESTINATION_CHANNEL), "orders");
        assert_eq!(message.payload(), b"{}");
    }
}

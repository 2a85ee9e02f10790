//! Causal identifiers for the unit of work currently being processed.

use uuid::Uuid;

/// Identifies the request (usually an inbound message) being processed and
/// the causal chain it belongs to.
///
/// Every message published while handling a request inherits the request's
/// correlation id, and records the request id as its causation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    request_id: String,
    correlation_id: String,
    causation_id: String,
}

impl RequestContext {
    /// Starts a new causal chain rooted at a freshly generated request id.
    pub fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            request_id: id.clone(),
            correlation_id: id.clone(),
            causation_id: id,
        }
    }

    /// Builds the context for an inbound message.
    ///
    /// A message without correlation or causation ids starts a new chain
    /// rooted at its own id.
    pub fn for_message(
        message_id: impl Into<String>,
        correlation_id: &str,
        causation_id: &str,
    ) -> Self {
        let request_id = message_id.into();
        let correlation_id = if correlation_id.is_empty() {
            request_id.clone()
        } else {
            correlation_id.to_string()
        };
        let causation_id = if causation_id.is_empty() {
            request_id.clone()
        } else {
            causation_id.to_string()
        };
        Self {
            request_id,
            correlation_id,
            causation_id,
        }
    }

    /// Id of the request being processed.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Id shared by every message in this causal chain.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Id of the message that caused this request.
    pub fn causation_id(&self) -> &str {
        &self.causation_id
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

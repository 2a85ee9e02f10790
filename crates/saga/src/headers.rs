//! Saga routing headers.
//!
//! Commands sent by an orchestrator carry the `command-saga-*` headers; the
//! participant's reply echoes them back as `reply-saga-*`.

pub const MESSAGE_COMMAND_SAGA_ID: &str = "command-saga-id";
pub const MESSAGE_COMMAND_SAGA_NAME: &str = "command-saga-name";

pub const MESSAGE_REPLY_SAGA_ID: &str = "reply-saga-id";
pub const MESSAGE_REPLY_SAGA_NAME: &str = "reply-saga-name";

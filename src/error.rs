//! Canonical fault taxonomy for the crate.
//!
//! Every layer constructs a [`HubLinkError`] with the right kind at the
//! point of detection; nothing is wrapped and re-wrapped on the way up.
//! API misuse (starting a running connector, queueing while stopped) is
//! rejected with the small dedicated enums in [`crate::connector`] instead
//! of this taxonomy.

use crate::envelope::HubError;

/// Faults detected while operating the hub link.
#[derive(Debug, thiserror::Error)]
pub enum HubLinkError {
    /// Connect, TLS handshake, or read/write failure on the transport.
    /// Always routed through disconnect and backoff, never fatal.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed frame, unknown body tag, or missing handler. Reported as
    /// a command-error response when a command id is addressable,
    /// otherwise treated as a stream-level fault.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A command handler failed. Translated to a command-error wire
    /// response; the connection is unaffected.
    #[error("command failed: {code}: {message}")]
    Handler {
        /// Stable failure code carried into the command-error response.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// The hub rejected authentication or routing. Recorded as the last
    /// error and surfaced to the error hook; does not disconnect.
    #[error("hub error: {0}")]
    Hub(HubError),
}

impl HubLinkError {
    /// Construct a protocol violation with the given description.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Construct a handler failure with a stable code.
    #[must_use]
    pub fn handler(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Canonical result alias used by `hublink` public APIs.
pub type Result<T> = std::result::Result<T, HubLinkError>;

/// Render a caught panic payload for logging.
///
/// Panic payloads are almost always `&str` or `String`; anything else is
/// reported by type only.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

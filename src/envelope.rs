//! Wire message model for the hub protocol.
//!
//! An [`Envelope`] is the top-level unit exchanged with the hub: identity
//! fields naming the sending and receiving endpoints, a protocol version,
//! and a payload union covering commands, command responses, and
//! out-of-band control traffic. Envelopes are immutable once serialized
//! and parsed exactly once per received frame group.

use bincode::{config, error::DecodeError, error::EncodeError};
use serde::{Deserialize, Serialize};

/// Protocol version stamped on every transmitted envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Header describing an inbound or outbound command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHeader {
    /// Unique identifier correlating the command with its response.
    pub id: String,
    /// Registered command name used for handler resolution.
    pub name: String,
    /// Data-format tag describing the body encoding (see [`crate::body`]).
    pub data_format: String,
    /// Number of raw body-chunk frames following the envelope frame.
    pub body_chunks: u32,
}

/// Failure detail attached to a command-error response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    /// Stable machine-readable failure code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional diagnostic detail, empty when none.
    pub details: String,
}

/// Header describing the response to a previously issued command.
///
/// A response with `error` set is a command-error response: it carries no
/// body and `data_format` is empty. Exactly one response is sent per
/// command that reached a handler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Identifier of the command being answered.
    pub id: String,
    /// Name of the command being answered.
    pub name: String,
    /// Data-format tag for the response body.
    pub data_format: String,
    /// Number of raw body-chunk frames following the envelope frame.
    pub body_chunks: u32,
    /// Set when the command failed instead of producing a result.
    pub error: Option<CommandError>,
}

/// Hub-level error report (authentication or routing rejection).
///
/// Delivered by the hub as a dedicated payload case; recorded as the
/// connector's last error and surfaced to the error hook, but never a
/// reason to disconnect by itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubError {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub text: String,
    /// Optional diagnostic detail, empty when none.
    pub details: String,
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Payload union carried by an [`Envelope`].
///
/// There is no "not set" case: an envelope cannot be constructed without a
/// payload, so the invariant that empty payloads are never transmitted
/// holds by construction. A received discriminant outside this union fails
/// decoding and is treated as a protocol violation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// A named, identified request expecting exactly one response.
    Command(CommandHeader),
    /// The response (or command error) for a previously issued command.
    CommandResponse(ResponseHeader),
    /// Keep-alive probe from the peer, answered with [`Payload::Pong`].
    Ping,
    /// Keep-alive reply.
    Pong,
    /// Hub-level failure report.
    HubError(HubError),
}

impl Payload {
    /// Short name of the payload case, used in log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "COMMAND",
            Self::CommandResponse(_) => "COMMAND_RESPONSE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::HubError(_) => "HUB_ERROR",
        }
    }

    /// Number of raw body-chunk frames announced by this payload.
    ///
    /// Only commands and responses carry bodies; control payloads are
    /// always a single envelope frame.
    #[must_use]
    pub fn body_chunks(&self) -> u32 {
        match self {
            Self::Command(cmd) => cmd.body_chunks,
            Self::CommandResponse(resp) => resp.body_chunks,
            Self::Ping | Self::Pong | Self::HubError(_) => 0,
        }
    }
}

/// One wire message: identity fields plus the payload union.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identifier of the sending endpoint.
    pub source: String,
    /// Identifier of the destination endpoint.
    pub target: String,
    /// Protocol version, [`PROTOCOL_VERSION`] for everything we send.
    pub version: u32,
    /// The payload case.
    pub payload: Payload,
}

impl Envelope {
    /// Construct an envelope addressed from `source` to `target`.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Build a reply envelope with the source and target identities swapped.
    #[must_use]
    pub fn reply(&self, payload: Payload) -> Self {
        Self {
            source: self.target.clone(),
            target: self.source.clone(),
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Serialize the envelope into its wire form.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        bincode::serde::encode_to_vec(self, config::standard())
    }

    /// Deserialize an envelope from its wire form.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] if the bytes do not form a complete,
    /// well-formed envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (envelope, _consumed) =
            bincode::serde::decode_from_slice(bytes, config::standard())?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn command_payload() -> Payload {
        Payload::Command(CommandHeader {
            id: "C1".into(),
            name: "Echo".into(),
            data_format: "json:EchoRequest".into(),
            body_chunks: 1,
        })
    }

    fn response_payload() -> Payload {
        Payload::CommandResponse(ResponseHeader {
            id: "C1".into(),
            name: "Echo".into(),
            data_format: String::new(),
            body_chunks: 0,
            error: Some(CommandError {
                code: "command.exception".into(),
                message: "boom".into(),
                details: String::new(),
            }),
        })
    }

    fn hub_error_payload() -> Payload {
        Payload::HubError(HubError {
            code: "authenticationFailure".into(),
            text: "bad password".into(),
            details: String::new(),
        })
    }

    #[rstest]
    #[case::command(command_payload())]
    #[case::command_response(response_payload())]
    #[case::ping(Payload::Ping)]
    #[case::pong(Payload::Pong)]
    #[case::hub_error(hub_error_payload())]
    fn round_trip_preserves_payload_case(#[case] payload: Payload) {
        let envelope = Envelope::new("daemon-1", "hub", payload);
        let bytes = envelope.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[rstest]
    fn reply_swaps_identities() {
        let request = Envelope::new("hub", "daemon-1", Payload::Ping);
        let reply = request.reply(Payload::Pong);
        assert_eq!(reply.source, "daemon-1");
        assert_eq!(reply.target, "hub");
        assert_eq!(reply.payload, Payload::Pong);
    }

    #[rstest]
    fn control_payloads_announce_no_body(
        #[values(Payload::Ping, Payload::Pong, hub_error_payload())] payload: Payload,
    ) {
        assert_eq!(payload.body_chunks(), 0);
    }

    #[rstest]
    fn truncated_bytes_fail_decoding() {
        let envelope = Envelope::new("daemon-1", "hub", command_payload());
        let bytes = envelope.to_bytes().unwrap();
        assert!(Envelope::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }
}

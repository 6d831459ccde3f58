//! Command body encoding and the data-format tag contract.
//!
//! A command's body travels as raw length-prefixed chunks after the
//! envelope frame; the envelope's data-format tag tells the receiver how
//! to decode them without out-of-band schema negotiation:
//!
//! - `""` — no body;
//! - `"bytes"` — opaque binary chunks, handed through untouched;
//! - `"<encoding>:<type-name>"` — a structured body, e.g.
//!   `"json:EchoRequest"`.
//!
//! An unrecognized encoding prefix or malformed tag fails decoding with a
//! protocol violation; it is never treated as binary fallback.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{HubLinkError, Result};

/// Sentinel tag for opaque binary chunk bodies.
pub const BODY_BYTES: &str = "bytes";
/// Encoding prefix for structured JSON bodies.
pub const ENCODING_JSON: &str = "json";

/// A decoded command or response body.
#[derive(Clone, Debug, PartialEq)]
pub enum BodyValue {
    /// No body was transmitted.
    Empty,
    /// Opaque binary chunks, untouched by the codec.
    Bytes(Vec<Bytes>),
    /// A structured JSON value tagged with its type name.
    Json {
        /// Structural type identifier carried in the data-format tag.
        type_name: String,
        /// The decoded document.
        value: serde_json::Value,
    },
}

impl BodyValue {
    /// Encode a typed value as a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`HubLinkError::Handler`] if the value cannot be
    /// serialized; a local value that will not serialize is a handler
    /// fault, not a peer protocol violation.
    pub fn from_json<T: JsonBody>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| HubLinkError::handler("body.encode", e.to_string()))?;
        Ok(Self::Json {
            type_name: T::TYPE_NAME.to_owned(),
            value,
        })
    }

    /// Decode a JSON body into its typed form, checking the type name.
    ///
    /// # Errors
    ///
    /// Returns [`HubLinkError::ProtocolViolation`] if the body is not
    /// JSON, carries a different type name, or does not deserialize.
    pub fn to_json<T: JsonBody>(&self) -> Result<T> {
        let Self::Json { type_name, value } = self else {
            return Err(HubLinkError::protocol(format!(
                "expected a json:{} body",
                T::TYPE_NAME
            )));
        };
        if type_name != T::TYPE_NAME {
            return Err(HubLinkError::protocol(format!(
                "expected body type {}, received {type_name}",
                T::TYPE_NAME
            )));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| HubLinkError::protocol(format!("bad {type_name} body: {e}")))
    }
}

/// Marker for types that travel as `json:<TYPE_NAME>` bodies.
pub trait JsonBody: Serialize + DeserializeOwned {
    /// Structural type identifier transmitted in the data-format tag.
    const TYPE_NAME: &'static str;
}

/// Collaborator seam for body encoding and decoding.
///
/// The connector core only ever calls these two methods; specific
/// encodings are pluggable. [`JsonBodyCodec`] is the default and covers
/// the built-in tag contract.
pub trait BodyCodec: Send + Sync {
    /// Decode `chunks` per `data_format` into a structured value.
    ///
    /// # Errors
    ///
    /// Returns [`HubLinkError::ProtocolViolation`] for unknown or
    /// malformed tags and undecodable bodies.
    fn decode(&self, data_format: &str, chunks: &[Bytes]) -> Result<BodyValue>;

    /// Encode `value` into a data-format tag plus raw chunks.
    ///
    /// # Errors
    ///
    /// Returns [`HubLinkError::Handler`] if the value cannot be encoded.
    fn encode(&self, value: &BodyValue) -> Result<(String, Vec<Bytes>)>;
}

/// Default body codec implementing the built-in tag contract.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonBodyCodec;

impl BodyCodec for JsonBodyCodec {
    fn decode(&self, data_format: &str, chunks: &[Bytes]) -> Result<BodyValue> {
        match data_format {
            "" => Ok(BodyValue::Empty),
            BODY_BYTES => Ok(BodyValue::Bytes(chunks.to_vec())),
            tag => {
                let Some((encoding, type_name)) = tag.split_once(':') else {
                    return Err(HubLinkError::protocol(format!("unknown body type {tag}")));
                };
                if encoding != ENCODING_JSON || type_name.is_empty() {
                    return Err(HubLinkError::protocol(format!("unknown body type {tag}")));
                }
                let joined = chunks.concat();
                let value = serde_json::from_slice(&joined).map_err(|e| {
                    HubLinkError::protocol(format!("bad {tag} body: {e}"))
                })?;
                Ok(BodyValue::Json {
                    type_name: type_name.to_owned(),
                    value,
                })
            }
        }
    }

    fn encode(&self, value: &BodyValue) -> Result<(String, Vec<Bytes>)> {
        match value {
            BodyValue::Empty => Ok((String::new(), Vec::new())),
            BodyValue::Bytes(chunks) => Ok((BODY_BYTES.to_owned(), chunks.clone())),
            BodyValue::Json { type_name, value } => {
                let bytes = serde_json::to_vec(value)
                    .map_err(|e| HubLinkError::handler("body.encode", e.to_string()))?;
                Ok((
                    format!("{ENCODING_JSON}:{type_name}"),
                    vec![Bytes::from(bytes)],
                ))
            }
        }
    }
}

//! Length-prefixed frame codec for the hub wire protocol.
//!
//! Every frame is a 4-byte big-endian length prefix followed by that many
//! bytes. A packet group is one serialized [`Envelope`] frame followed by
//! the number of raw body-chunk frames the envelope announces. Frames
//! above [`MAX_FRAME_LENGTH`] are a protocol violation, never silently
//! truncated.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::{
    envelope::Envelope,
    error::{HubLinkError, Result},
};

/// Maximum single frame size accepted or produced (1 MiB).
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Build the length-delimited codec used on both directions of the link.
#[must_use]
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .length_field_length(4)
        .big_endian()
        .new_codec()
}

/// Framed reader half of a hub connection.
pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;
/// Framed writer half of a hub connection.
pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

/// Wrap a read half in the hub frame codec.
pub fn frame_reader<R: AsyncRead>(read: R) -> FrameReader<R> {
    FramedRead::new(read, frame_codec())
}

/// Wrap a write half in the hub frame codec.
pub fn frame_writer<W: AsyncWrite>(write: W) -> FrameWriter<W> {
    FramedWrite::new(write, frame_codec())
}

fn map_frame_error(error: std::io::Error) -> HubLinkError {
    // LengthDelimitedCodec signals an over-limit frame as InvalidData;
    // that is a peer protocol fault, not a transport failure.
    if error.kind() == std::io::ErrorKind::InvalidData {
        HubLinkError::protocol(format!("bad frame: {error}"))
    } else {
        HubLinkError::Transport(error)
    }
}

/// Read one complete packet group: the envelope plus its body chunks.
///
/// Returns `Ok(None)` on a clean end of stream at a group boundary.
///
/// # Errors
///
/// Returns [`HubLinkError::Transport`] for I/O failures,
/// [`HubLinkError::ProtocolViolation`] for malformed envelopes, oversized
/// frames, or a stream that ends inside a frame group.
pub async fn read_packet<R>(
    framed: &mut FrameReader<R>,
) -> Result<Option<(Envelope, Vec<Bytes>)>>
where
    R: AsyncRead + Unpin,
{
    let Some(frame) = framed.next().await else {
        return Ok(None);
    };
    let frame = frame.map_err(map_frame_error)?;
    let envelope = Envelope::from_bytes(&frame)
        .map_err(|e| HubLinkError::protocol(format!("bad envelope: {e}")))?;

    let expected = envelope.payload.body_chunks() as usize;
    let mut chunks = Vec::with_capacity(expected);
    for received in 0..expected {
        let Some(chunk) = framed.next().await else {
            return Err(HubLinkError::protocol(format!(
                "stream ended inside a frame group ({received} of {expected} chunks)"
            )));
        };
        chunks.push(chunk.map_err(map_frame_error)?.freeze());
    }
    Ok(Some((envelope, chunks)))
}

/// Write one complete packet group and flush it.
///
/// # Errors
///
/// Returns [`HubLinkError::Transport`] for I/O failures and
/// [`HubLinkError::ProtocolViolation`] if the envelope cannot be encoded
/// or a chunk exceeds [`MAX_FRAME_LENGTH`].
pub async fn write_packet<W>(
    framed: &mut FrameWriter<W>,
    envelope: &Envelope,
    chunks: &[Bytes],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = envelope
        .to_bytes()
        .map_err(|e| HubLinkError::protocol(format!("unencodable envelope: {e}")))?;
    framed.feed(Bytes::from(bytes)).await.map_err(map_frame_error)?;
    for chunk in chunks {
        framed.feed(chunk.clone()).await.map_err(map_frame_error)?;
    }
    framed.flush().await.map_err(map_frame_error)
}

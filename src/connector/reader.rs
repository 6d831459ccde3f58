//! The reader loop: blocks on frame groups and dispatches them.
//!
//! Spawned by the writer after each successful connect, one per socket
//! generation. Pings are answered on the HUB tier, hub errors are
//! recorded without disconnecting, commands go to the dispatcher, and
//! responses go to the response hook. The loop exits on read failure,
//! end of stream, or generation cancel; every exit runs the idempotent
//! disconnect so the writer can schedule the reconnect.

use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tokio::io::ReadHalf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::{Connector, Inner};
use crate::{
    channel::BoxedStream,
    codec,
    dispatch,
    envelope::{Envelope, Payload},
    error::panic_message,
    queue::{Packet, PacketPrio},
};

pub(crate) async fn run(
    inner: Arc<Inner>,
    read_half: ReadHalf<BoxedStream>,
    token: CancellationToken,
) {
    debug!(endpoint = %inner.config.endpoint_id, "reader started");
    let reason = match AssertUnwindSafe(read_loop(&inner, read_half, token))
        .catch_unwind()
        .await
    {
        Ok(reason) => reason,
        Err(panic) => {
            error!(
                endpoint = %inner.config.endpoint_id,
                panic = %panic_message(&*panic),
                "reader loop panicked"
            );
            "reader loop panicked".to_owned()
        }
    };
    inner.reader_exited(&reason);
}

async fn read_loop(
    inner: &Arc<Inner>,
    read_half: ReadHalf<BoxedStream>,
    token: CancellationToken,
) -> String {
    let mut framed = codec::frame_reader(read_half);

    loop {
        tokio::select! {
            biased;

            () = token.cancelled() => break "socket generation cancelled".to_owned(),

            group = codec::read_packet(&mut framed) => match group {
                Ok(Some((envelope, chunks))) => {
                    trace!(
                        endpoint = %inner.config.endpoint_id,
                        payload = envelope.payload.kind(),
                        "packet received"
                    );
                    handle_packet(inner, envelope, chunks).await;
                }
                Ok(None) => break "peer closed the stream".to_owned(),
                Err(e) => break e.to_string(),
            }
        }
    }
}

/// Route one inbound packet group.
///
/// Faults addressable to a command id are answered on the wire by the
/// dispatcher and never tear down the connection; stream-level faults
/// are detected in the codec before we get here.
async fn handle_packet(inner: &Arc<Inner>, envelope: Envelope, chunks: Vec<bytes::Bytes>) {
    match &envelope.payload {
        Payload::Ping => respond_with_pong(inner, &envelope),
        Payload::Pong => trace!(endpoint = %inner.config.endpoint_id, "pong received"),
        Payload::HubError(error) => inner.record_hub_error(error.clone()),
        Payload::CommandResponse(_) => inner.notify_response(&envelope, &chunks),
        Payload::Command(_) => {
            let connector = Connector::from_inner(Arc::clone(inner));
            dispatch::dispatch_command(&connector, envelope, chunks).await;
        }
    }
}

/// Answer a ping on the HUB tier. Loss is tolerable: if the connector is
/// winding down the pong is simply dropped.
fn respond_with_pong(inner: &Arc<Inner>, ping: &Envelope) {
    let pong = Packet::control(ping.reply(Payload::Pong));
    if let Err(e) = inner.enqueue(PacketPrio::Hub, pong) {
        debug!(endpoint = %inner.config.endpoint_id, error = %e, "pong dropped");
    }
}

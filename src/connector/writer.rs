//! The writer loop: connection lifecycle driver and sole sender.
//!
//! One action per iteration: exit when terminating, connect when due,
//! wait out the backoff, or dequeue and transmit exactly one packet with
//! HUB > PRIORITY > NORMAL precedence. Only this loop creates sockets
//! and spawns the reader; disconnects may come from either loop.

use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tokio::io::WriteHalf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{Inner, reader};
use crate::{
    channel::BoxedStream,
    codec::{self, FrameWriter},
    error::panic_message,
    queue::{Packet, PacketPrio},
    state::ConnectorState,
};

enum WriteAction {
    Exit,
    Connect,
    Wait(std::time::Duration),
    Transmit(PacketPrio, Packet),
}

/// Decide the next writer action under the connector lock.
fn next_action(inner: &Inner) -> WriteAction {
    let mut shared = inner.lock();
    match shared.state {
        ConnectorState::Terminating | ConnectorState::Stopped => WriteAction::Exit,
        ConnectorState::Connecting => WriteAction::Connect,
        ConnectorState::ReconnectWait => match shared.timer.remaining() {
            None => {
                inner.set_state(&mut shared, ConnectorState::Connecting);
                WriteAction::Connect
            }
            Some(left) => {
                debug!(endpoint = %inner.config.endpoint_id, ?left, "waiting out reconnect backoff");
                WriteAction::Wait(left.min(inner.config.max_idle_wait))
            }
        },
        state @ (ConnectorState::Connected | ConnectorState::Authenticated) => {
            match shared.queues.pop_eligible(state) {
                Some((prio, packet)) => WriteAction::Transmit(prio, packet),
                None => WriteAction::Wait(inner.config.max_idle_wait),
            }
        }
    }
}

pub(crate) async fn run(inner: Arc<Inner>) {
    debug!(
        endpoint = %inner.config.endpoint_id,
        target = %inner.config.target_id,
        "writer started"
    );
    // The cleanup path must run even if the loop itself has a fatal bug;
    // the connector recovers through the ordinary disconnect route.
    if let Err(panic) = AssertUnwindSafe(write_loop(&inner)).catch_unwind().await {
        error!(
            endpoint = %inner.config.endpoint_id,
            panic = %panic_message(&*panic),
            "writer loop panicked"
        );
    }
    inner.writer_exited();
}

async fn write_loop(inner: &Arc<Inner>) {
    let mut io: Option<FrameWriter<WriteHalf<BoxedStream>>> = None;

    loop {
        match next_action(inner) {
            WriteAction::Exit => break,
            WriteAction::Connect => {
                // A stale write half from the previous generation is
                // dropped before a new socket exists.
                io = None;
                io = connect(inner).await;
            }
            WriteAction::Wait(wait) => {
                if !inner.lock().state.is_online() {
                    io = None;
                }
                let _ = tokio::time::timeout(wait, inner.wakeup.notified()).await;
            }
            WriteAction::Transmit(prio, packet) => {
                transmit(inner, &mut io, prio, packet).await;
            }
        }
    }
}

/// Attempt one connect. On success the reader for the new socket
/// generation is spawned and the state moves to CONNECTED; on failure
/// the disconnect path schedules the backoff.
async fn connect(inner: &Arc<Inner>) -> Option<FrameWriter<WriteHalf<BoxedStream>>> {
    // The previous reader must be gone before a new generation starts;
    // its token is already cancelled, so this join is prompt.
    let stale = inner.lock().reader_task.take();
    if let Some(task) = stale {
        let _ = task.await;
    }

    match inner.factory.connect().await {
        Ok(stream) => {
            let (read_half, write_half) = tokio::io::split(stream);
            let token = CancellationToken::new();
            let mut shared = inner.lock();
            if shared.state != ConnectorState::Connecting {
                // Termination raced the connect; the fresh socket is
                // discarded and the loop exits on its next iteration.
                return None;
            }
            let reader_task = tokio::spawn(reader::run(
                Arc::clone(inner),
                read_half,
                token.clone(),
            ));
            shared.generation = token;
            shared.reader_alive = true;
            shared.reader_task = Some(reader_task);
            inner.set_state(&mut shared, ConnectorState::Connected);
            drop(shared);
            Some(codec::frame_writer(write_half))
        }
        Err(e) => {
            warn!(endpoint = %inner.config.endpoint_id, error = %e, "connect attempt failed");
            inner.disconnect("connect failed");
            None
        }
    }
}

/// Send one packet. A failed send disconnects the socket; PRIORITY and
/// NORMAL packets are pushed back to the head of their queue so they are
/// retried first after reconnect, HUB packets are control traffic and
/// are not retried.
async fn transmit(
    inner: &Arc<Inner>,
    io: &mut Option<FrameWriter<WriteHalf<BoxedStream>>>,
    prio: PacketPrio,
    packet: Packet,
) {
    let result = match io.as_mut() {
        Some(writer) => codec::write_packet(writer, &packet.envelope, &packet.chunks).await,
        None => Err(crate::error::HubLinkError::Transport(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "socket already torn down",
        ))),
    };

    match result {
        Ok(()) => {
            debug!(
                endpoint = %inner.config.endpoint_id,
                payload = packet.envelope.payload.kind(),
                ?prio,
                "packet sent"
            );
        }
        Err(e) => {
            error!(
                endpoint = %inner.config.endpoint_id,
                payload = packet.envelope.payload.kind(),
                error = %e,
                "packet send failed"
            );
            *io = None;
            inner.disconnect("packet send failed");
            if prio != PacketPrio::Hub {
                inner.lock().queues.requeue_front(prio, packet);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::{
        channel::TcpChannelFactory,
        config::ConnectorConfig,
        connector::Connector,
        envelope::{Envelope, Payload},
    };

    fn authenticated_inner() -> Arc<Inner> {
        let connector = Connector::builder(
            ConnectorConfig::new("daemon-1", "hub"),
            Arc::new(TcpChannelFactory::new("127.0.0.1", 1)),
        )
        .build();
        connector.inner().lock().state = ConnectorState::Authenticated;
        Arc::clone(connector.inner())
    }

    fn pong_packet(tag: &str) -> Packet {
        Packet::control(Envelope::new(tag, "hub", Payload::Pong))
    }

    #[rstest]
    #[tokio::test]
    async fn failed_normal_send_pushes_the_packet_back_to_the_head() {
        let inner = authenticated_inner();
        inner.lock().queues.push(PacketPrio::Normal, pong_packet("later"));

        // No socket: the send fails and the packet must come back first.
        let mut io = None;
        transmit(&inner, &mut io, PacketPrio::Normal, pong_packet("failed")).await;

        let mut shared = inner.lock();
        assert_eq!(shared.state, ConnectorState::ReconnectWait);
        shared.state = ConnectorState::Authenticated;
        let (_, first) = shared
            .queues
            .pop_eligible(ConnectorState::Authenticated)
            .unwrap();
        assert_eq!(first.envelope.source, "failed");
        let (_, second) = shared
            .queues
            .pop_eligible(ConnectorState::Authenticated)
            .unwrap();
        assert_eq!(second.envelope.source, "later");
    }

    #[rstest]
    #[tokio::test]
    async fn failed_hub_send_is_not_retried() {
        let inner = authenticated_inner();

        let mut io = None;
        transmit(&inner, &mut io, PacketPrio::Hub, pong_packet("control")).await;

        let mut shared = inner.lock();
        assert_eq!(shared.state, ConnectorState::ReconnectWait);
        shared.state = ConnectorState::Authenticated;
        assert!(
            shared
                .queues
                .pop_eligible(ConnectorState::Authenticated)
                .is_none()
        );
        assert_eq!(shared.queues.len(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn send_failure_schedules_a_reconnect_attempt() {
        let inner = authenticated_inner();
        let mut io = None;
        transmit(&inner, &mut io, PacketPrio::Normal, pong_packet("x")).await;
        assert_eq!(inner.lock().timer.reconnect_count(), 1);
    }
}

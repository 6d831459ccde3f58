//! Test helpers for exercising a `hublink` connector against an
//! in-process stub hub.
//!
//! [`StubHub`] listens on a loopback port and hands out scripted
//! [`HubConnection`]s speaking the real frame protocol, so connector
//! scenarios (authentication, reconnect, command dispatch) run without a
//! broker deployment or TLS material.

use std::time::Duration;

use bytes::Bytes;
use hublink::{
    ConnectorState,
    codec::{self, FrameReader, FrameWriter},
    envelope::{CommandHeader, Envelope, HubError, Payload},
};
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::{TcpListener, TcpStream},
    sync::broadcast,
};
use tracing::debug;

/// How long helper waits give the connector before failing the test.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(5);

/// A loopback listener standing in for the hub.
pub struct StubHub {
    listener: TcpListener,
    ident: String,
}

impl StubHub {
    /// Bind a stub hub on an ephemeral loopback port.
    ///
    /// # Panics
    ///
    /// Panics if the loopback bind fails; test environment fault.
    pub async fn bind(ident: impl Into<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind stub hub listener");
        Self {
            listener,
            ident: ident.into(),
        }
    }

    /// Port the stub hub is listening on.
    ///
    /// # Panics
    ///
    /// Panics if the local address cannot be read.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.listener
            .local_addr()
            .expect("stub hub has a local address")
            .port()
    }

    /// Accept the next connector link, failing the test after
    /// [`SCENARIO_TIMEOUT`].
    ///
    /// # Panics
    ///
    /// Panics if no connection arrives in time.
    pub async fn accept(&self) -> HubConnection {
        let (stream, peer) = tokio::time::timeout(SCENARIO_TIMEOUT, self.listener.accept())
            .await
            .expect("timed out waiting for the connector to dial in")
            .expect("stub hub accept failed");
        debug!(%peer, "stub hub accepted a connection");
        let (read_half, write_half) = tokio::io::split(stream);
        HubConnection {
            ident: self.ident.clone(),
            reader: codec::frame_reader(read_half),
            writer: codec::frame_writer(write_half),
        }
    }
}

/// One accepted connector link, scripted frame by frame.
pub struct HubConnection {
    ident: String,
    reader: FrameReader<ReadHalf<TcpStream>>,
    writer: FrameWriter<WriteHalf<TcpStream>>,
}

impl HubConnection {
    /// Read the next packet group from the connector.
    ///
    /// # Panics
    ///
    /// Panics on timeout, stream close, or protocol error; scripted
    /// scenarios always know what they expect next.
    pub async fn read_packet(&mut self) -> (Envelope, Vec<Bytes>) {
        tokio::time::timeout(SCENARIO_TIMEOUT, codec::read_packet(&mut self.reader))
            .await
            .expect("timed out waiting for a packet from the connector")
            .expect("stub hub failed to read a packet")
            .expect("connector closed the stream mid-scenario")
    }

    /// Send a raw packet group to the connector.
    ///
    /// # Panics
    ///
    /// Panics if the write fails.
    pub async fn send(&mut self, envelope: &Envelope, chunks: &[Bytes]) {
        codec::write_packet(&mut self.writer, envelope, chunks)
            .await
            .expect("stub hub failed to write a packet");
    }

    /// Ping the connector, as the hub does on idle links.
    pub async fn send_ping(&mut self, target: &str) {
        let envelope = Envelope::new(self.ident.clone(), target, Payload::Ping);
        self.send(&envelope, &[]).await;
    }

    /// Deliver a hub-level error envelope.
    pub async fn send_hub_error(&mut self, target: &str, code: &str, text: &str) {
        let envelope = Envelope::new(
            self.ident.clone(),
            target,
            Payload::HubError(HubError {
                code: code.into(),
                text: text.into(),
                details: String::new(),
            }),
        );
        self.send(&envelope, &[]).await;
    }

    /// Deliver a JSON-bodied command to the connector.
    pub async fn send_json_command(
        &mut self,
        target: &str,
        id: &str,
        name: &str,
        type_name: &str,
        json: &str,
    ) {
        let chunks = vec![Bytes::copy_from_slice(json.as_bytes())];
        let envelope = Envelope::new(
            self.ident.clone(),
            target,
            Payload::Command(CommandHeader {
                id: id.into(),
                name: name.into(),
                data_format: format!("json:{type_name}"),
                body_chunks: 1,
            }),
        );
        self.send(&envelope, &chunks).await;
    }

    /// Drop the link abruptly, as a crashing hub would.
    pub fn abort(self) {
        drop(self);
    }
}

/// Await a specific state on a connector's state stream, skipping
/// intermediate transitions.
///
/// # Panics
///
/// Panics if the state does not arrive within [`SCENARIO_TIMEOUT`] or
/// the stream closes.
pub async fn await_state(
    events: &mut broadcast::Receiver<ConnectorState>,
    wanted: ConnectorState,
) {
    tokio::time::timeout(SCENARIO_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(state) if state == wanted => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("state stream closed before reaching {wanted}")
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {wanted}"));
}

/// Collect states from the stream until `last` arrives, returning the
/// observed sequence including it.
///
/// # Panics
///
/// Panics on timeout or a closed stream.
pub async fn collect_states_until(
    events: &mut broadcast::Receiver<ConnectorState>,
    last: ConnectorState,
) -> Vec<ConnectorState> {
    tokio::time::timeout(SCENARIO_TIMEOUT, async {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(state) => {
                    seen.push(state);
                    if state == last {
                        break seen;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("state stream closed before reaching {last}")
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {last}"))
}

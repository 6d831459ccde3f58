//! The connector: one reconnecting logical link to a hub.
//!
//! A [`Connector`] owns exactly two long-lived transport tasks once
//! started. The writer loop drives connects, backoff waits, and sends;
//! the reader loop is spawned by the writer after each successful connect
//! and dispatches inbound traffic. All shared mutable state (lifecycle
//! state, transmit queues, reconnect timer, last hub error) lives behind
//! one mutex; sockets are replaced wholesale on every reconnect and torn
//! down idempotently from either loop.

mod reader;
mod writer;

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::{
    sync::{Notify, broadcast},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::ReconnectTimer,
    body::{BodyCodec, BodyValue, JsonBodyCodec},
    config::ConnectorConfig,
    channel::ChannelFactory,
    dispatch::{CommandEvent, HandlerRegistry},
    envelope::{CommandHeader, Envelope, HubError, Payload},
    error::Result,
    queue::{Packet, PacketPrio, TransmitQueues},
    state::ConnectorState,
};

/// Hook invoked for every HUB_ERROR envelope received.
pub type HubErrorHook = Arc<dyn Fn(&HubError) + Send + Sync>;

/// Hook invoked for every COMMAND_RESPONSE envelope received, carrying
/// the envelope and its raw body chunks.
pub type ResponseHook = Arc<dyn Fn(&Envelope, &[Bytes]) + Send + Sync>;

/// Error returned when a packet is queued in a state that rejects sends.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The connector is STOPPED or TERMINATING.
    #[error("cannot queue packets while the connector is {0}")]
    InvalidState(ConnectorState),
}

/// Error returned by [`Connector::start`].
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The connector can only be started from STOPPED.
    #[error("the connector is {0}, it can only be started when STOPPED")]
    NotStopped(ConnectorState),
}

pub(crate) struct Shared {
    pub(crate) state: ConnectorState,
    pub(crate) queues: TransmitQueues,
    pub(crate) timer: ReconnectTimer,
    pub(crate) last_error: Option<HubError>,
    /// Cancelled on every disconnect; a fresh token is issued per connect.
    pub(crate) generation: CancellationToken,
    pub(crate) writer_alive: bool,
    pub(crate) reader_alive: bool,
    pub(crate) writer_task: Option<JoinHandle<()>>,
    pub(crate) reader_task: Option<JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub(crate) config: ConnectorConfig,
    pub(crate) factory: Arc<dyn ChannelFactory>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) body_codec: Arc<dyn BodyCodec>,
    pub(crate) on_hub_error: Option<HubErrorHook>,
    pub(crate) on_response: Option<ResponseHook>,
    pub(crate) shared: Mutex<Shared>,
    pub(crate) wakeup: Notify,
    state_events: broadcast::Sender<ConnectorState>,
    command_events: broadcast::Sender<CommandEvent>,
}

impl Inner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("connector state lock poisoned")
    }

    /// Transition the lifecycle state and publish the new value.
    ///
    /// Publishing happens under the lock so subscribers observe
    /// transitions in order; lagging subscribers skip to the latest.
    pub(crate) fn set_state(&self, shared: &mut Shared, next: ConnectorState) {
        if shared.state == next {
            return;
        }
        debug!(endpoint = %self.config.endpoint_id, from = %shared.state, to = %next, "state transition");
        shared.state = next;
        let _ = self.state_events.send(next);
    }

    pub(crate) fn publish_command_event(&self, event: CommandEvent) {
        let _ = self.command_events.send(event);
    }

    /// Tear down the current socket generation and recompute the state.
    ///
    /// Callable from either transport loop; a second call for an already
    /// torn-down socket is a no-op. Only this path moves the connector
    /// into RECONNECT_WAIT or, when terminating with both loops gone,
    /// back to STOPPED.
    pub(crate) fn disconnect(&self, reason: &str) {
        let mut shared = self.lock();
        shared.generation.cancel();
        match shared.state {
            ConnectorState::Terminating => {
                if !shared.writer_alive && !shared.reader_alive {
                    self.set_state(&mut shared, ConnectorState::Stopped);
                }
            }
            ConnectorState::Connecting
            | ConnectorState::Connected
            | ConnectorState::Authenticated => {
                warn!(endpoint = %self.config.endpoint_id, reason, "disconnected");
                shared.timer.schedule_retry();
                self.set_state(&mut shared, ConnectorState::ReconnectWait);
            }
            // Already offline; nothing to recompute.
            ConnectorState::Stopped | ConnectorState::ReconnectWait => {}
        }
        drop(shared);
        self.wakeup.notify_one();
    }

    /// Record a hub-level error and surface it to the hook.
    ///
    /// Hub errors never force a disconnect by themselves; whether to
    /// retry with different credentials is the collaborator's call.
    pub(crate) fn record_hub_error(&self, error: HubError) {
        warn!(endpoint = %self.config.endpoint_id, code = %error.code, text = %error.text, "hub error received");
        {
            let mut shared = self.lock();
            shared.last_error = Some(error.clone());
        }
        if let Some(hook) = &self.on_hub_error {
            hook(&error);
        }
    }

    pub(crate) fn notify_response(&self, envelope: &Envelope, chunks: &[Bytes]) {
        if let Some(hook) = &self.on_response {
            hook(envelope, chunks);
        }
    }

    /// Queue a packet, waking the writer. Shared by the public API and
    /// the dispatcher's response path.
    pub(crate) fn enqueue(&self, prio: PacketPrio, packet: Packet) -> std::result::Result<(), SendError> {
        let mut shared = self.lock();
        if shared.state.rejects_sends() {
            return Err(SendError::InvalidState(shared.state));
        }
        shared.queues.push(prio, packet);
        drop(shared);
        self.wakeup.notify_one();
        Ok(())
    }

    fn writer_exited(&self) {
        {
            let mut shared = self.lock();
            shared.writer_alive = false;
        }
        self.disconnect("writer terminating");
        debug!(endpoint = %self.config.endpoint_id, "writer terminated");
    }

    fn reader_exited(&self, reason: &str) {
        {
            let mut shared = self.lock();
            shared.reader_alive = false;
        }
        self.disconnect(reason);
        debug!(endpoint = %self.config.endpoint_id, "reader terminated");
    }
}

/// Handle to one reconnecting hub link. Cheap to clone; all clones share
/// the same connector instance.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl Connector {
    /// Start building a connector for the given identities and channel.
    #[must_use]
    pub fn builder(
        config: ConnectorConfig,
        factory: Arc<dyn ChannelFactory>,
    ) -> ConnectorBuilder {
        ConnectorBuilder {
            config,
            factory,
            registry: HandlerRegistry::new(),
            body_codec: Arc::new(JsonBodyCodec),
            on_hub_error: None,
            on_response: None,
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Start the connector: STOPPED → CONNECTING, spawning the writer
    /// loop. The reader loop is spawned by the writer once a connect
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StartError::NotStopped`] unless the connector is
    /// STOPPED.
    pub fn start(&self) -> std::result::Result<(), StartError> {
        let mut shared = self.inner.lock();
        if shared.state != ConnectorState::Stopped || shared.writer_alive {
            return Err(StartError::NotStopped(shared.state));
        }
        shared.timer = ReconnectTimer::new();
        shared.writer_alive = true;
        self.inner.set_state(&mut shared, ConnectorState::Connecting);
        let task = tokio::spawn(writer::run(Arc::clone(&self.inner)));
        shared.writer_task = Some(task);
        drop(shared);
        info!(endpoint = %self.inner.config.endpoint_id, target = %self.inner.config.target_id, "connector started");
        Ok(())
    }

    /// Request termination. Idempotent; does not wait for the transport
    /// loops to exit.
    pub fn terminate(&self) {
        let mut shared = self.inner.lock();
        if matches!(
            shared.state,
            ConnectorState::Stopped | ConnectorState::Terminating
        ) {
            return;
        }
        info!(endpoint = %self.inner.config.endpoint_id, "terminate requested");
        self.inner.set_state(&mut shared, ConnectorState::Terminating);
        shared.generation.cancel();
        drop(shared);
        self.inner.wakeup.notify_one();
    }

    /// Terminate and join both transport loops within the configured
    /// grace period, logging (not erroring) any loop that overruns it.
    pub async fn terminate_and_wait(&self) {
        self.terminate();
        let (writer_task, reader_task) = {
            let mut shared = self.inner.lock();
            (shared.writer_task.take(), shared.reader_task.take())
        };
        let grace = self.inner.config.termination_grace;
        for (name, task) in [("writer", writer_task), ("reader", reader_task)] {
            let Some(task) = task else { continue };
            if tokio::time::timeout(grace, task).await.is_err() {
                error!(endpoint = %self.inner.config.endpoint_id, loop_name = name, "transport loop did not exit within the grace period");
            }
        }
    }

    /// Signal from the authentication collaborator that the higher-level
    /// challenge/response completed: CONNECTED → AUTHENTICATED, opening
    /// the PRIORITY and NORMAL tiers and resetting the reconnect counter.
    pub fn authorized(&self) {
        let mut shared = self.inner.lock();
        if shared.state == ConnectorState::Connected {
            shared.timer.reset();
            self.inner.set_state(&mut shared, ConnectorState::Authenticated);
            drop(shared);
            self.inner.wakeup.notify_one();
        }
    }

    /// Queue a packet on the given tier.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::InvalidState`] while the connector is
    /// STOPPED or TERMINATING; queueing in those states is a caller
    /// error, not a deferred send.
    pub fn send_packet(
        &self,
        prio: PacketPrio,
        packet: Packet,
    ) -> std::result::Result<(), SendError> {
        self.inner.enqueue(prio, packet)
    }

    /// Encode `body` and wrap it in a command envelope addressed to the
    /// configured target.
    ///
    /// # Errors
    ///
    /// Returns the body codec's error if the body cannot be encoded.
    pub fn encode_command(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        body: &BodyValue,
    ) -> Result<Packet> {
        let (data_format, chunks) = self.inner.body_codec.encode(body)?;
        let header = CommandHeader {
            id: id.into(),
            name: name.into(),
            data_format,
            body_chunks: u32::try_from(chunks.len()).expect("chunk count fits in u32"),
        };
        let envelope = Envelope::new(
            self.inner.config.endpoint_id.clone(),
            self.inner.config.target_id.clone(),
            Payload::Command(header),
        );
        Ok(Packet::new(envelope, chunks))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectorState {
        self.inner.lock().state
    }

    /// Subscribe to lifecycle state transitions.
    ///
    /// Delivery is at-least-once per subscriber for transitions after
    /// subscription; a slow subscriber skips to the latest state rather
    /// than accumulating a backlog.
    #[must_use]
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectorState> {
        self.inner.state_events.subscribe()
    }

    /// Subscribe to per-command status events
    /// (PENDING → RUNNING → COMPLETED/FAILED).
    #[must_use]
    pub fn subscribe_command_events(&self) -> broadcast::Receiver<CommandEvent> {
        self.inner.command_events.subscribe()
    }

    /// The most recent hub-level error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<HubError> {
        self.inner.lock().last_error.clone()
    }

    /// Consecutive failed connect attempts since the link last reached
    /// AUTHENTICATED.
    #[must_use]
    pub fn reconnect_count(&self) -> u32 {
        self.inner.lock().timer.reconnect_count()
    }

    /// Identifier of this endpoint.
    #[must_use]
    pub fn endpoint_id(&self) -> &str {
        &self.inner.config.endpoint_id
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("endpoint_id", &self.inner.config.endpoint_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Builder assembling a [`Connector`] and its collaborator seams.
pub struct ConnectorBuilder {
    config: ConnectorConfig,
    factory: Arc<dyn ChannelFactory>,
    registry: HandlerRegistry,
    body_codec: Arc<dyn BodyCodec>,
    on_hub_error: Option<HubErrorHook>,
    on_response: Option<ResponseHook>,
}

impl ConnectorBuilder {
    /// Register a command handler. Registration happens at startup; the
    /// dispatcher never discovers handlers at runtime.
    #[must_use]
    pub fn handler(
        self,
        name: impl Into<String>,
        mode: crate::dispatch::DispatchMode,
        handler: impl crate::dispatch::CommandHandler + 'static,
    ) -> Self {
        self.registry.register(name, mode, handler);
        self
    }

    /// Replace the default JSON body codec.
    #[must_use]
    pub fn body_codec(mut self, codec: impl BodyCodec + 'static) -> Self {
        self.body_codec = Arc::new(codec);
        self
    }

    /// Hook invoked for every hub-level error envelope.
    #[must_use]
    pub fn on_hub_error(mut self, hook: impl Fn(&HubError) + Send + Sync + 'static) -> Self {
        self.on_hub_error = Some(Arc::new(hook));
        self
    }

    /// Hook invoked for every command response envelope.
    #[must_use]
    pub fn on_response(
        mut self,
        hook: impl Fn(&Envelope, &[Bytes]) + Send + Sync + 'static,
    ) -> Self {
        self.on_response = Some(Arc::new(hook));
        self
    }

    /// Finish building the connector. The connector starts STOPPED.
    #[must_use]
    pub fn build(self) -> Connector {
        let (state_events, _) = broadcast::channel(32);
        let (command_events, _) = broadcast::channel(64);
        let inner = Inner {
            config: self.config,
            factory: self.factory,
            registry: Arc::new(self.registry),
            body_codec: self.body_codec,
            on_hub_error: self.on_hub_error,
            on_response: self.on_response,
            shared: Mutex::new(Shared {
                state: ConnectorState::Stopped,
                queues: TransmitQueues::default(),
                timer: ReconnectTimer::new(),
                last_error: None,
                generation: CancellationToken::new(),
                writer_alive: false,
                reader_alive: false,
                writer_task: None,
                reader_task: None,
            }),
            wakeup: Notify::new(),
            state_events,
            command_events,
        };
        Connector {
            inner: Arc::new(inner),
        }
    }
}

//! Command dispatch: from a received command envelope to exactly one
//! response on the wire.
//!
//! Handlers are bound to command names in an explicit registry populated
//! at startup; resolution failure is a plain lookup miss answered with a
//! "no handler" command error before any user code runs. Each
//! registration carries a data-driven dispatch mode: `Inline` handlers
//! run on the reader loop and must be trivial, `Deferred` handlers run on
//! a spawned worker so slow commands never backpressure the reader.
//! Handler failures become command-error responses; they never tear down
//! the connection.

use std::{panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::{
    body::BodyValue,
    connector::Connector,
    envelope::{CommandError, CommandHeader, Envelope, Payload, ResponseHeader},
    error::{HubLinkError, Result, panic_message},
    queue::{Packet, PacketPrio},
};

/// Failure code for a command with no registered handler.
pub const CODE_NO_HANDLER: &str = "command.noHandler";
/// Failure code for a command whose body violates the protocol.
pub const CODE_PROTOCOL: &str = "protocol.violation";
/// Generic failure code for handler exceptions.
pub const CODE_EXCEPTION: &str = "command.exception";

/// Where a handler executes relative to the reader loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Run on the reader loop; the response is ready before the next
    /// frame is processed. Only for trivial, fast commands.
    Inline,
    /// Run on a spawned worker; the reader continues immediately.
    Deferred,
}

/// Execution status of one inbound command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    /// Dispatched, body not yet decoded or handler not yet started.
    Pending,
    /// The handler is executing.
    Running,
    /// The handler produced a result; the response is queued.
    Completed,
    /// The command failed; a command-error response is queued.
    Failed,
}

/// Status event published for every command lifecycle step.
#[derive(Clone, Debug)]
pub struct CommandEvent {
    /// Identifier of the command this event belongs to.
    pub id: String,
    /// Name of the command.
    pub name: String,
    /// New status.
    pub status: CommandStatus,
}

/// A registered command implementation.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute the command and produce the response body.
    ///
    /// # Errors
    ///
    /// Any error is translated into a command-error response carrying
    /// the error's code; the connection is unaffected.
    async fn execute(&self, ctx: &CommandContext, body: BodyValue) -> Result<BodyValue>;
}

#[derive(Clone)]
struct Registration {
    mode: DispatchMode,
    handler: Arc<dyn CommandHandler>,
}

/// Explicit mapping from command name to handler, populated at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Registration>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `name`, replacing any previous binding.
    pub fn register(
        &self,
        name: impl Into<String>,
        mode: DispatchMode,
        handler: impl CommandHandler + 'static,
    ) {
        self.handlers.insert(
            name.into(),
            Registration {
                mode,
                handler: Arc::new(handler),
            },
        );
    }

    fn resolve(&self, name: &str) -> Option<Registration> {
        self.handlers.get(name).map(|entry| entry.value().clone())
    }
}

/// Per-command scratch state: the connector, the source envelope, and
/// the identity needed to address the single response. One context per
/// inbound command, discarded after the response is queued.
pub struct CommandContext {
    connector: Connector,
    source: Envelope,
    command: CommandHeader,
}

impl CommandContext {
    fn new(connector: Connector, source: Envelope, command: CommandHeader) -> Self {
        Self {
            connector,
            source,
            command,
        }
    }

    /// The connector this command arrived on.
    #[must_use]
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// The envelope that carried the command.
    #[must_use]
    pub fn source_envelope(&self) -> &Envelope {
        &self.source
    }

    /// Header of the command being executed.
    #[must_use]
    pub fn command(&self) -> &CommandHeader {
        &self.command
    }

    fn publish_status(&self, status: CommandStatus) {
        self.connector.inner().publish_command_event(CommandEvent {
            id: self.command.id.clone(),
            name: self.command.name.clone(),
            status,
        });
    }

    /// Queue the successful response on the NORMAL tier.
    fn respond_body(&self, body: &BodyValue) -> Result<()> {
        let (data_format, chunks) = self.connector.inner().body_codec.encode(body)?;
        let header = ResponseHeader {
            id: self.command.id.clone(),
            name: self.command.name.clone(),
            data_format,
            body_chunks: u32::try_from(chunks.len()).expect("chunk count fits in u32"),
            error: None,
        };
        let packet = Packet::new(
            self.source.reply(Payload::CommandResponse(header)),
            chunks,
        );
        self.enqueue_response(packet);
        Ok(())
    }

    /// Queue a command-error response referencing the original command id
    /// and name on the NORMAL tier.
    fn respond_error(&self, code: impl Into<String>, message: String, details: String) {
        let header = ResponseHeader {
            id: self.command.id.clone(),
            name: self.command.name.clone(),
            data_format: String::new(),
            body_chunks: 0,
            error: Some(CommandError {
                code: code.into(),
                message,
                details,
            }),
        };
        let packet = Packet::control(self.source.reply(Payload::CommandResponse(header)));
        self.enqueue_response(packet);
    }

    fn enqueue_response(&self, packet: Packet) {
        if let Err(e) = self
            .connector
            .inner()
            .enqueue(PacketPrio::Normal, packet)
        {
            // Termination raced the response; the command outcome is
            // still observable on the event stream.
            debug!(
                command = %self.command.name,
                id = %self.command.id,
                error = %e,
                "response dropped"
            );
        }
    }
}

/// Dispatch one received command envelope.
///
/// Decodes the body per its data-format tag, resolves the handler, and
/// runs it inline or on a worker per its registration. Every command
/// that reaches this point produces exactly one response or
/// command-error response.
pub(crate) async fn dispatch_command(
    connector: &Connector,
    envelope: Envelope,
    chunks: Vec<bytes::Bytes>,
) {
    let Payload::Command(command) = envelope.payload.clone() else {
        return;
    };
    let ctx = CommandContext::new(connector.clone(), envelope, command);
    ctx.publish_status(CommandStatus::Pending);

    let body = match connector
        .inner()
        .body_codec
        .decode(&ctx.command.data_format, &chunks)
    {
        Ok(body) => body,
        Err(e) => {
            warn!(command = %ctx.command.name, id = %ctx.command.id, error = %e, "undecodable command body");
            ctx.respond_error(CODE_PROTOCOL, e.to_string(), String::new());
            ctx.publish_status(CommandStatus::Failed);
            return;
        }
    };

    let Some(registration) = connector.inner().registry.resolve(&ctx.command.name) else {
        warn!(command = %ctx.command.name, id = %ctx.command.id, "no handler registered");
        ctx.respond_error(
            CODE_NO_HANDLER,
            format!("no handler for command {}", ctx.command.name),
            String::new(),
        );
        ctx.publish_status(CommandStatus::Failed);
        return;
    };

    match registration.mode {
        DispatchMode::Inline => run_handler(ctx, registration.handler, body).await,
        DispatchMode::Deferred => {
            tokio::spawn(run_handler(ctx, registration.handler, body));
        }
    }
}

/// Execute the handler and queue its single response.
///
/// A panicking handler is contained here: it becomes a command-error
/// response like any other failure and never takes the reader (or a
/// worker) down with it.
async fn run_handler(ctx: CommandContext, handler: Arc<dyn CommandHandler>, body: BodyValue) {
    ctx.publish_status(CommandStatus::Running);
    let outcome = match AssertUnwindSafe(handler.execute(&ctx, body))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => Err(HubLinkError::handler(
            CODE_EXCEPTION,
            format!("handler panicked: {}", panic_message(&*panic)),
        )),
    };
    match outcome.and_then(|reply| ctx.respond_body(&reply)) {
        Ok(()) => ctx.publish_status(CommandStatus::Completed),
        Err(e) => {
            warn!(command = %ctx.command.name, id = %ctx.command.id, error = %e, "command failed");
            let (code, message, details) = translate_failure(e);
            ctx.respond_error(code, message, details);
            ctx.publish_status(CommandStatus::Failed);
        }
    }
}

/// Map a handler failure onto the command-error wire fields. The fault
/// kind is decided where the fault is detected, so no unwrapping is
/// needed here.
fn translate_failure(error: HubLinkError) -> (String, String, String) {
    match error {
        HubLinkError::Handler { code, message } => (code, message, String::new()),
        HubLinkError::ProtocolViolation(message) => {
            (CODE_PROTOCOL.to_owned(), message, String::new())
        }
        HubLinkError::Hub(hub) => (hub.code, hub.text, hub.details),
        HubLinkError::Transport(e) => (CODE_EXCEPTION.to_owned(), e.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use rstest::rstest;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        body::JsonBody,
        channel::TcpChannelFactory,
        config::ConnectorConfig,
        state::ConnectorState,
    };

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct EchoRequest {
        text: String,
    }

    impl JsonBody for EchoRequest {
        const TYPE_NAME: &'static str = "EchoRequest";
    }

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn execute(&self, _ctx: &CommandContext, body: BodyValue) -> Result<BodyValue> {
            let request: EchoRequest = body.to_json()?;
            BodyValue::from_json(&request)
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl CommandHandler for FailingHandler {
        async fn execute(&self, _ctx: &CommandContext, _body: BodyValue) -> Result<BodyValue> {
            Err(HubLinkError::handler("test.boom", "it broke"))
        }
    }

    fn connector_with(name: &str, mode: DispatchMode, handler: impl CommandHandler + 'static) -> Connector {
        let connector = Connector::builder(
            ConnectorConfig::new("daemon-1", "hub"),
            Arc::new(TcpChannelFactory::new("127.0.0.1", 1)),
        )
        .handler(name, mode, handler)
        .build();
        // Dispatch requires an authenticated link for responses to queue;
        // these tests drive the dispatcher directly without a socket.
        connector.inner().lock().state = ConnectorState::Authenticated;
        connector
    }

    fn echo_command(id: &str, name: &str) -> (Envelope, Vec<Bytes>) {
        let envelope = Envelope::new(
            "hub",
            "daemon-1",
            Payload::Command(CommandHeader {
                id: id.into(),
                name: name.into(),
                data_format: "json:EchoRequest".into(),
                body_chunks: 1,
            }),
        );
        (envelope, vec![Bytes::from_static(br#"{"text":"hi"}"#)])
    }

    fn take_response(connector: &Connector) -> Packet {
        connector
            .inner()
            .lock()
            .queues
            .pop_eligible(ConnectorState::Authenticated)
            .expect("expected a queued response")
            .1
    }

    fn response_header(packet: &Packet) -> ResponseHeader {
        match &packet.envelope.payload {
            Payload::CommandResponse(header) => header.clone(),
            other => panic!("expected a command response, got {}", other.kind()),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn inline_echo_yields_one_matching_response() {
        let connector = connector_with("Echo", DispatchMode::Inline, EchoHandler);
        let mut events = connector.subscribe_command_events();
        let (envelope, chunks) = echo_command("C1", "Echo");

        dispatch_command(&connector, envelope, chunks).await;

        let packet = take_response(&connector);
        let header = response_header(&packet);
        assert_eq!(header.id, "C1");
        assert_eq!(header.name, "Echo");
        assert!(header.error.is_none());
        assert_eq!(header.data_format, "json:EchoRequest");
        assert_eq!(packet.chunks.len(), 1);
        let echoed: EchoRequest = serde_json::from_slice(&packet.chunks[0]).unwrap();
        assert_eq!(echoed.text, "hi");

        // Exactly one response was queued.
        assert!(
            connector
                .inner()
                .lock()
                .queues
                .pop_eligible(ConnectorState::Authenticated)
                .is_none()
        );

        let statuses: Vec<CommandStatus> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| event.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                CommandStatus::Pending,
                CommandStatus::Running,
                CommandStatus::Completed
            ]
        );
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_command_fails_with_no_handler() {
        let connector = connector_with("Echo", DispatchMode::Inline, EchoHandler);
        let (envelope, chunks) = echo_command("C2", "Missing");

        dispatch_command(&connector, envelope, chunks).await;

        let header = response_header(&take_response(&connector));
        assert_eq!(header.id, "C2");
        assert_eq!(header.name, "Missing");
        let error = header.error.expect("expected a command error");
        assert_eq!(error.code, CODE_NO_HANDLER);
    }

    #[rstest]
    #[tokio::test]
    async fn handler_failure_carries_its_code() {
        let connector = connector_with("Echo", DispatchMode::Inline, FailingHandler);
        let (envelope, chunks) = echo_command("C3", "Echo");

        dispatch_command(&connector, envelope, chunks).await;

        let error = response_header(&take_response(&connector))
            .error
            .expect("expected a command error");
        assert_eq!(error.code, "test.boom");
        assert_eq!(error.message, "it broke");
    }

    #[rstest]
    #[tokio::test]
    async fn panicking_handler_becomes_a_command_error() {
        struct PanickingHandler;

        #[async_trait]
        impl CommandHandler for PanickingHandler {
            async fn execute(&self, _ctx: &CommandContext, _body: BodyValue) -> Result<BodyValue> {
                panic!("kaboom")
            }
        }

        let connector = connector_with("Echo", DispatchMode::Inline, PanickingHandler);
        let (envelope, chunks) = echo_command("C6", "Echo");

        dispatch_command(&connector, envelope, chunks).await;

        let error = response_header(&take_response(&connector))
            .error
            .expect("expected a command error");
        assert_eq!(error.code, CODE_EXCEPTION);
        assert!(error.message.contains("kaboom"), "{}", error.message);
    }

    #[rstest]
    #[tokio::test]
    async fn undecodable_body_is_rejected_before_the_handler_runs() {
        let connector = connector_with("Echo", DispatchMode::Inline, FailingHandler);
        let mut events = connector.subscribe_command_events();
        let envelope = Envelope::new(
            "hub",
            "daemon-1",
            Payload::Command(CommandHeader {
                id: "C4".into(),
                name: "Echo".into(),
                data_format: "xml:EchoRequest".into(),
                body_chunks: 0,
            }),
        );

        dispatch_command(&connector, envelope, Vec::new()).await;

        let error = response_header(&take_response(&connector))
            .error
            .expect("expected a command error");
        assert_eq!(error.code, CODE_PROTOCOL);

        // The handler never ran: no RUNNING event was published.
        let statuses: Vec<CommandStatus> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| event.status)
            .collect();
        assert_eq!(statuses, vec![CommandStatus::Pending, CommandStatus::Failed]);
    }

    #[rstest]
    #[tokio::test]
    async fn deferred_handler_responds_off_the_reader_path() {
        let connector = connector_with("Echo", DispatchMode::Deferred, EchoHandler);
        let mut events = connector.subscribe_command_events();
        let (envelope, chunks) = echo_command("C5", "Echo");

        dispatch_command(&connector, envelope, chunks).await;

        // Wait for the worker to finish via the status stream.
        loop {
            let event = events.recv().await.unwrap();
            if event.status == CommandStatus::Completed {
                break;
            }
        }
        let header = response_header(&take_response(&connector));
        assert_eq!(header.id, "C5");
        assert!(header.error.is_none());
    }
}

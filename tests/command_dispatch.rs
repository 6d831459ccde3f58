//! End-to-end command dispatch scenarios over the wire.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hublink::{
    BodyValue, CommandContext, CommandHandler, CommandStatus, Connector, ConnectorConfig,
    ConnectorState, DispatchMode, JsonBody, Payload, Result, TcpChannelFactory,
};
use hublink_testing::{StubHub, await_state};
use rstest::rstest;
use serde::{Deserialize, Serialize};

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

async fn authenticated_pair(
    hub: &StubHub,
    connector: &Connector,
) -> hublink_testing::HubConnection {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut states = connector.subscribe_state();
    connector.start().unwrap();
    let link = hub.accept().await;
    await_state(&mut states, ConnectorState::Connected).await;
    connector.authorized();
    await_state(&mut states, ConnectorState::Authenticated).await;
    link
}

#[rstest]
#[tokio::test]
async fn echo_command_round_trips_with_the_same_id() {
    let hub = StubHub::bind("hub").await;
    let factory = Arc::new(TcpChannelFactory::new("127.0.0.1", hub.port()));
    let connector = Connector::builder(ConnectorConfig::new("daemon-1", "hub"), factory)
        .handler("Echo", DispatchMode::Inline, EchoHandler)
        .build();
    let mut link = authenticated_pair(&hub, &connector).await;

    link.send_json_command("daemon-1", "C1", "Echo", "EchoRequest", r#"{"text":"hi"}"#)
        .await;

    let (response, chunks) = link.read_packet().await;
    let Payload::CommandResponse(header) = &response.payload else {
        panic!("expected a command response, got {}", response.payload.kind());
    };
    assert_eq!(header.id, "C1");
    assert_eq!(header.name, "Echo");
    assert!(header.error.is_none());
    assert_eq!(header.data_format, "json:EchoRequest");
    let echoed: EchoRequest = serde_json::from_slice(&chunks[0]).unwrap();
    assert_eq!(echoed, EchoRequest { text: "hi".into() });

    connector.terminate_and_wait().await;
}

#[rstest]
#[tokio::test]
async fn unknown_command_is_answered_and_the_link_survives() {
    let hub = StubHub::bind("hub").await;
    let factory = Arc::new(TcpChannelFactory::new("127.0.0.1", hub.port()));
    let connector = Connector::builder(ConnectorConfig::new("daemon-1", "hub"), factory)
        .handler("Echo", DispatchMode::Inline, EchoHandler)
        .build();
    let mut link = authenticated_pair(&hub, &connector).await;

    link.send_json_command("daemon-1", "C9", "Vanish", "EchoRequest", r#"{"text":"x"}"#)
        .await;

    let (response, _) = link.read_packet().await;
    let Payload::CommandResponse(header) = &response.payload else {
        panic!("expected a command response, got {}", response.payload.kind());
    };
    assert_eq!(header.id, "C9");
    assert_eq!(header.name, "Vanish");
    let error = header.error.as_ref().expect("expected a command error");
    assert_eq!(error.code, "command.noHandler");

    assert_eq!(connector.state(), ConnectorState::Authenticated);
    connector.terminate_and_wait().await;
}

#[rstest]
#[tokio::test]
async fn deferred_handlers_do_not_block_the_reader() {
    struct GatedEcho {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl CommandHandler for GatedEcho {
        async fn execute(&self, _ctx: &CommandContext, body: BodyValue) -> Result<BodyValue> {
            // Park until the test opens the gate; a deferred handler
            // must not stall frame processing meanwhile.
            self.gate.notified().await;
            Ok(body)
        }
    }

    let hub = StubHub::bind("hub").await;
    let factory = Arc::new(TcpChannelFactory::new("127.0.0.1", hub.port()));
    let gate = Arc::new(tokio::sync::Notify::new());
    let connector = Connector::builder(ConnectorConfig::new("daemon-1", "hub"), factory)
        .handler("Slow", DispatchMode::Deferred, GatedEcho { gate: Arc::clone(&gate) })
        .build();
    let mut command_events = connector.subscribe_command_events();
    let mut link = authenticated_pair(&hub, &connector).await;

    link.send_json_command("daemon-1", "S1", "Slow", "EchoRequest", r#"{"text":"a"}"#)
        .await;

    // The handler is running (and parked)...
    loop {
        let event = command_events.recv().await.unwrap();
        if event.status == CommandStatus::Running {
            break;
        }
    }
    // ...while the reader keeps serving pings.
    link.send_ping("daemon-1").await;
    let (pong, _) = link.read_packet().await;
    assert_eq!(pong.payload, Payload::Pong);

    gate.notify_one();
    let (response, _) = link.read_packet().await;
    let Payload::CommandResponse(header) = &response.payload else {
        panic!("expected a command response, got {}", response.payload.kind());
    };
    assert_eq!(header.id, "S1");

    connector.terminate_and_wait().await;
}

#[rstest]
#[tokio::test]
async fn hub_errors_are_recorded_and_surfaced_without_disconnecting() {
    let hub = StubHub::bind("hub").await;
    let factory = Arc::new(TcpChannelFactory::new("127.0.0.1", hub.port()));
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let connector = Connector::builder(ConnectorConfig::new("daemon-1", "hub"), factory)
        .on_hub_error(move |error| {
            sink.lock().unwrap().push(error.code.clone());
        })
        .build();
    let mut link = authenticated_pair(&hub, &connector).await;

    link.send_hub_error("daemon-1", "authenticationFailure", "bad password")
        .await;

    // The error is delivered asynchronously; prove ordering by pinging
    // afterwards and waiting for the reply.
    link.send_ping("daemon-1").await;
    let (pong, _) = link.read_packet().await;
    assert_eq!(pong.payload, Payload::Pong);

    let last = connector.last_error().expect("hub error must be recorded");
    assert_eq!(last.code, "authenticationFailure");
    assert_eq!(observed.lock().unwrap().as_slice(), ["authenticationFailure"]);
    assert_eq!(connector.state(), ConnectorState::Authenticated);

    connector.terminate_and_wait().await;
}

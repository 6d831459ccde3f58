#![doc(html_root_url = "https://docs.rs/hublink/latest")]
//! Public API for the `hublink` library.
//!
//! This crate provides the transport and session core for daemons that
//! keep one reconnecting, authenticated, multiplexed link to a hub:
//! a framed wire protocol, tiered transmit queues, a dual-loop transport
//! with backoff reconnect, pinned-trust TLS, and a command dispatcher.

pub mod backoff;
pub mod body;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod queue;
pub mod state;

pub use body::{BodyCodec, BodyValue, JsonBody, JsonBodyCodec};
pub use channel::{ChannelFactory, PinnedTlsFactory, TcpChannelFactory};
pub use config::ConnectorConfig;
pub use connector::{Connector, ConnectorBuilder, SendError, StartError};
pub use dispatch::{
    CommandContext,
    CommandEvent,
    CommandHandler,
    CommandStatus,
    DispatchMode,
    HandlerRegistry,
};
pub use envelope::{CommandError, CommandHeader, Envelope, HubError, Payload, ResponseHeader};
pub use error::{HubLinkError, Result};
pub use queue::{Packet, PacketPrio};
pub use state::ConnectorState;

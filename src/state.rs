//! Connector lifecycle states.
//!
//! Exactly one [`ConnectorState`] exists per connector, owned by the
//! shared cell in [`crate::connector`] and mutated only under its lock.
//! Transitions follow the table in the crate documentation; the writer
//! loop drives connects, either loop may drive a disconnect.

/// Lifecycle state of a connector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectorState {
    /// Not started, or fully terminated with both transport loops exited.
    Stopped,
    /// The writer loop is attempting a socket + TLS handshake.
    Connecting,
    /// Transport established; only HUB-tier traffic may flow.
    Connected,
    /// The authorization signal arrived; all tiers may flow.
    Authenticated,
    /// Waiting out the backoff delay before the next connect attempt.
    ReconnectWait,
    /// Termination requested; both loops are winding down.
    Terminating,
}

impl ConnectorState {
    /// True while the transport is usable for at least HUB-tier sends.
    #[must_use]
    pub fn is_online(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }

    /// True when enqueueing new packets is a caller error.
    #[must_use]
    pub fn rejects_sends(self) -> bool {
        matches!(self, Self::Stopped | Self::Terminating)
    }
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "STOPPED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Authenticated => "AUTHENTICATED",
            Self::ReconnectWait => "RECONNECT_WAIT",
            Self::Terminating => "TERMINATING",
        };
        f.write_str(name)
    }
}

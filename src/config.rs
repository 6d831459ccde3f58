//! Connector configuration.

use std::time::Duration;

/// Configuration for a [`crate::Connector`].
///
/// The hub endpoint itself lives in the channel factory; this carries the
/// identities stamped on every envelope and the connector's timing knobs.
#[derive(Clone, Debug)]
pub struct ConnectorConfig {
    /// Identifier of this endpoint, the `source` of every envelope sent.
    pub endpoint_id: String,
    /// Identifier of the peer endpoint commands are addressed to.
    pub target_id: String,
    /// Upper bound on the writer loop's idle wait between wakeups.
    pub max_idle_wait: Duration,
    /// Grace period [`crate::Connector::terminate_and_wait`] allows each
    /// transport loop to exit before reporting it stuck.
    pub termination_grace: Duration,
}

impl ConnectorConfig {
    /// Configuration with default timing for the given identities.
    #[must_use]
    pub fn new(endpoint_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            target_id: target_id.into(),
            max_idle_wait: Duration::from_secs(10),
            termination_grace: Duration::from_secs(5),
        }
    }

    /// Override the writer loop's maximum idle wait.
    #[must_use]
    pub fn with_max_idle_wait(mut self, wait: Duration) -> Self {
        self.max_idle_wait = wait;
        self
    }

    /// Override the termination grace period.
    #[must_use]
    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }
}

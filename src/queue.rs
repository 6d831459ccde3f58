//! Tiered transmit queues feeding the writer loop.
//!
//! Three ordered queues hold pending packets. HUB carries control traffic
//! (pong replies, acks): eligible as soon as the link is CONNECTED and
//! never retried after a failed send. PRIORITY and NORMAL carry
//! end-to-end traffic: eligible only once AUTHENTICATED, and a failed
//! send re-inserts the packet at the head of its queue so it is retried
//! first after reconnect.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::{envelope::Envelope, state::ConnectorState};

/// Transmit tier for an outbound packet, in strict dequeue precedence
/// order: HUB before PRIORITY before NORMAL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketPrio {
    /// Control traffic, sent while merely CONNECTED, loss tolerated.
    Hub,
    /// High-priority end-to-end traffic.
    Priority,
    /// Ordinary end-to-end traffic.
    Normal,
}

/// A pending send action: a fully encoded envelope plus its body chunks.
///
/// Owned by the calling task until enqueued, then by its queue until the
/// writer dequeues it.
#[derive(Clone, Debug)]
pub struct Packet {
    /// The envelope to transmit.
    pub envelope: Envelope,
    /// Raw body chunks following the envelope frame.
    pub chunks: Vec<Bytes>,
}

impl Packet {
    /// Bundle an envelope with its body chunks.
    ///
    /// The envelope's announced chunk count must match `chunks`; the
    /// codec transmits exactly what the envelope declares.
    #[must_use]
    pub fn new(envelope: Envelope, chunks: Vec<Bytes>) -> Self {
        debug_assert_eq!(envelope.payload.body_chunks() as usize, chunks.len());
        Self { envelope, chunks }
    }

    /// A bodyless control packet.
    #[must_use]
    pub fn control(envelope: Envelope) -> Self {
        Self::new(envelope, Vec::new())
    }
}

/// The three transmit tiers, guarded by the connector lock.
#[derive(Debug, Default)]
pub(crate) struct TransmitQueues {
    hub: VecDeque<Packet>,
    priority: VecDeque<Packet>,
    normal: VecDeque<Packet>,
}

impl TransmitQueues {
    fn tier(&mut self, prio: PacketPrio) -> &mut VecDeque<Packet> {
        match prio {
            PacketPrio::Hub => &mut self.hub,
            PacketPrio::Priority => &mut self.priority,
            PacketPrio::Normal => &mut self.normal,
        }
    }

    /// Append a packet to the tail of its tier.
    pub(crate) fn push(&mut self, prio: PacketPrio, packet: Packet) {
        self.tier(prio).push_back(packet);
    }

    /// Re-insert a send-failed packet at the head of its tier so it goes
    /// out first after reconnect. Never called for the HUB tier.
    pub(crate) fn requeue_front(&mut self, prio: PacketPrio, packet: Packet) {
        debug_assert_ne!(prio, PacketPrio::Hub);
        self.tier(prio).push_front(packet);
    }

    /// Dequeue the next packet eligible in `state`, honouring tier
    /// precedence. PRIORITY and NORMAL are gated on AUTHENTICATED.
    pub(crate) fn pop_eligible(
        &mut self,
        state: ConnectorState,
    ) -> Option<(PacketPrio, Packet)> {
        if !state.is_online() {
            return None;
        }
        if let Some(packet) = self.hub.pop_front() {
            return Some((PacketPrio::Hub, packet));
        }
        if state == ConnectorState::Authenticated {
            if let Some(packet) = self.priority.pop_front() {
                return Some((PacketPrio::Priority, packet));
            }
            if let Some(packet) = self.normal.pop_front() {
                return Some((PacketPrio::Normal, packet));
            }
        }
        None
    }

    /// Total packets pending across all tiers.
    pub(crate) fn len(&self) -> usize {
        self.hub.len() + self.priority.len() + self.normal.len()
    }
}

//! In-flight QoS 1 and QoS 2 delivery tracking
//!
//! Entries are owned here by value and keyed by direction plus packet
//! identifier. Outbound identifiers come from the tracker's own
//! [`PacketIdPool`]; inbound identifiers belong to the broker.

use std::cmp::Reverse;
use std::collections::HashMap;

use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::{MqttError, Result};
use crate::packet::publish::PublishPacket;
use crate::packet::pubrel::PubRelPacket;
use crate::packet::Packet;
use crate::packet_id::PacketIdPool;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::QoS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Handshake step an in-flight message is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
    AwaitingPubRel,
}

/// One message in the middle of a QoS 1 or QoS 2 handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightMessage {
    pub packet_id: u16,
    pub direction: Direction,
    pub qos: QoS,
    pub state: DeliveryState,
    /// The PUBLISH as sent or received, kept until release
    pub publish: PublishPacket,
    pub expiry_deadline: Option<Instant>,
    sequence: u64,
}

impl InFlightMessage {
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Seconds left before expiry, rounded up
    #[must_use]
    pub fn remaining_expiry(&self, now: Instant) -> Option<u32> {
        Some(seconds_rounded_up(
            self.expiry_deadline?.saturating_duration_since(now),
        ))
    }

    /// Outbound messages can expire until the broker has taken them.
    /// After PUBREC the broker owns the message and waits for PUBREL.
    fn can_expire(&self) -> bool {
        self.direction == Direction::Outbound && self.state != DeliveryState::AwaitingPubComp
    }
}

pub(crate) fn seconds_rounded_up(duration: Duration) -> u32 {
    let seconds = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    u32::try_from(seconds).unwrap_or(u32::MAX)
}

/// Result of a PUBREC arriving for an outbound QoS 2 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubRecOutcome {
    /// Handshake continues; PUBREL must be sent
    Release(u16),
    /// The broker refused the message with an error code; the handshake is over
    Rejected(InFlightMessage),
    /// No outbound QoS 2 entry for this identifier
    Unknown,
}

/// What the caller must do with an inbound PUBLISH
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction {
    /// QoS 0: hand to the application
    Deliver(PublishPacket),
    /// QoS 1: send PUBACK, then hand to the application
    AckAndDeliver(u16, PublishPacket),
    /// QoS 2: send PUBREC; delivery waits for PUBREL
    Receive { packet_id: u16, duplicate: bool },
}

/// Result of a PUBREL arriving for an inbound QoS 2 message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubRelOutcome {
    /// Send PUBCOMP and deliver
    Deliver(PublishPacket),
    /// Send PUBCOMP; the message expired while held and is not delivered
    Expired(u16),
    /// Send PUBCOMP with `PacketIdentifierNotFound`
    Unknown,
}

#[derive(Debug, Default)]
pub struct DeliveryTracker {
    entries: HashMap<(Direction, u16), InFlightMessage>,
    ids: PacketIdPool,
    next_sequence: u64,
}

fn deadline_for(publish: &PublishPacket, now: Instant) -> Option<Instant> {
    publish
        .message_expiry_interval()
        .map(|seconds| now + Duration::from_secs(u64::from(seconds)))
}

impl DeliveryTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an outbound packet identifier, `None` while all are in flight
    pub fn allocate_id(&mut self) -> Option<u16> {
        self.ids.allocate()
    }

    /// Returns an identifier that never reached `track_outbound`, or one used
    /// for SUBSCRIBE or UNSUBSCRIBE
    pub fn release_id(&mut self, packet_id: u16) {
        if self.entries.contains_key(&(Direction::Outbound, packet_id)) {
            return;
        }
        self.ids.release(packet_id);
    }

    /// Starts tracking an outbound QoS 1 or QoS 2 PUBLISH
    ///
    /// The expiry deadline is taken from the packet's message expiry interval,
    /// counted from `now`.
    ///
    /// # Errors
    ///
    /// `InvalidState` for QoS 0, a missing identifier or an identifier that is
    /// already tracked
    pub fn track_outbound(&mut self, publish: PublishPacket, now: Instant) -> Result<()> {
        let state = match publish.qos {
            QoS::AtMostOnce => {
                return Err(MqttError::InvalidState(
                    "QoS 0 messages are not tracked".to_string(),
                ))
            }
            QoS::AtLeastOnce => DeliveryState::AwaitingPubAck,
            QoS::ExactlyOnce => DeliveryState::AwaitingPubRec,
        };
        let packet_id = publish
            .packet_id
            .ok_or_else(|| MqttError::InvalidState("PUBLISH has no packet identifier".to_string()))?;
        let key = (Direction::Outbound, packet_id);
        if self.entries.contains_key(&key) {
            return Err(MqttError::InvalidState(format!(
                "Packet identifier {packet_id} already in flight"
            )));
        }
        self.ids.reserve(packet_id);

        let entry = InFlightMessage {
            packet_id,
            direction: Direction::Outbound,
            qos: publish.qos,
            state,
            expiry_deadline: deadline_for(&publish, now),
            publish,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        trace!(packet_id, qos = ?entry.qos, "Tracking outbound message");
        self.entries.insert(key, entry);
        Ok(())
    }

    fn complete_outbound(&mut self, packet_id: u16) -> Option<InFlightMessage> {
        let entry = self.entries.remove(&(Direction::Outbound, packet_id))?;
        self.ids.release(packet_id);
        Some(entry)
    }

    fn outbound_state(&self, packet_id: u16) -> Option<DeliveryState> {
        self.entries
            .get(&(Direction::Outbound, packet_id))
            .map(|entry| entry.state)
    }

    /// PUBACK completes an outbound QoS 1 handshake
    pub fn on_puback(&mut self, packet_id: u16) -> Option<InFlightMessage> {
        if self.outbound_state(packet_id) != Some(DeliveryState::AwaitingPubAck) {
            debug!(packet_id, "PUBACK for unknown packet identifier");
            return None;
        }
        self.complete_outbound(packet_id)
    }

    /// PUBREC moves an outbound QoS 2 message on to PUBREL
    ///
    /// A repeated PUBREC for a message already waiting on PUBCOMP asks for the
    /// PUBREL again.
    pub fn on_pubrec(&mut self, packet_id: u16, reason_code: ReasonCode) -> PubRecOutcome {
        match self.outbound_state(packet_id) {
            Some(DeliveryState::AwaitingPubRec) if reason_code.is_error() => {
                debug!(packet_id, reason = ?reason_code, "PUBREC rejected message");
                match self.complete_outbound(packet_id) {
                    Some(entry) => PubRecOutcome::Rejected(entry),
                    None => PubRecOutcome::Unknown,
                }
            }
            Some(DeliveryState::AwaitingPubRec | DeliveryState::AwaitingPubComp) => {
                if let Some(entry) = self.entries.get_mut(&(Direction::Outbound, packet_id)) {
                    entry.state = DeliveryState::AwaitingPubComp;
                }
                PubRecOutcome::Release(packet_id)
            }
            _ => {
                debug!(packet_id, "PUBREC for unknown packet identifier");
                PubRecOutcome::Unknown
            }
        }
    }

    /// PUBCOMP completes an outbound QoS 2 handshake
    pub fn on_pubcomp(&mut self, packet_id: u16) -> Option<InFlightMessage> {
        if self.outbound_state(packet_id) != Some(DeliveryState::AwaitingPubComp) {
            debug!(packet_id, "PUBCOMP for unknown packet identifier");
            return None;
        }
        self.complete_outbound(packet_id)
    }

    /// Classifies an inbound PUBLISH
    ///
    /// A QoS 2 PUBLISH whose identifier is already held is a retransmission:
    /// it is acknowledged again but never delivered twice.
    pub fn on_inbound_publish(&mut self, publish: PublishPacket, now: Instant) -> InboundAction {
        let Some(packet_id) = publish.packet_id else {
            return InboundAction::Deliver(publish);
        };
        match publish.qos {
            QoS::AtMostOnce => InboundAction::Deliver(publish),
            QoS::AtLeastOnce => InboundAction::AckAndDeliver(packet_id, publish),
            QoS::ExactlyOnce => {
                let key = (Direction::Inbound, packet_id);
                if self.entries.contains_key(&key) {
                    debug!(packet_id, dup = publish.dup, "Duplicate QoS 2 PUBLISH");
                    return InboundAction::Receive {
                        packet_id,
                        duplicate: true,
                    };
                }
                let entry = InFlightMessage {
                    packet_id,
                    direction: Direction::Inbound,
                    qos: QoS::ExactlyOnce,
                    state: DeliveryState::AwaitingPubRel,
                    expiry_deadline: deadline_for(&publish, now),
                    publish,
                    sequence: self.next_sequence,
                };
                self.next_sequence += 1;
                self.entries.insert(key, entry);
                InboundAction::Receive {
                    packet_id,
                    duplicate: false,
                }
            }
        }
    }

    /// PUBREL releases an inbound QoS 2 message
    pub fn on_pubrel(&mut self, packet_id: u16, now: Instant) -> PubRelOutcome {
        let Some(entry) = self.entries.remove(&(Direction::Inbound, packet_id)) else {
            debug!(packet_id, "PUBREL for unknown packet identifier");
            return PubRelOutcome::Unknown;
        };
        if entry.is_expired(now) {
            warn!(packet_id, topic = %entry.publish.topic_name, "Inbound message expired before release");
            return PubRelOutcome::Expired(packet_id);
        }
        PubRelOutcome::Deliver(entry.publish)
    }

    /// Earliest expiry deadline among outbound entries
    #[must_use]
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|entry| entry.can_expire())
            .filter_map(|entry| entry.expiry_deadline)
            .min()
    }

    /// Drops outbound entries whose deadline has passed and frees their identifiers
    ///
    /// QoS 2 messages already acknowledged with PUBREC are kept until PUBCOMP.
    pub fn expire(&mut self, now: Instant) -> Vec<InFlightMessage> {
        let expired: Vec<u16> = self
            .entries
            .values()
            .filter(|entry| entry.can_expire() && entry.is_expired(now))
            .map(|entry| entry.packet_id)
            .collect();

        let mut dropped: Vec<InFlightMessage> = expired
            .into_iter()
            .filter_map(|packet_id| self.complete_outbound(packet_id))
            .collect();
        dropped.sort_by_key(|entry| entry.sequence);
        for entry in &dropped {
            warn!(packet_id = entry.packet_id, topic = %entry.publish.topic_name, "Outbound message expired");
        }
        dropped
    }

    /// Packets to retransmit after resuming a session, in original send order
    ///
    /// Messages still waiting on PUBACK or PUBREC are re-sent as PUBLISH with
    /// DUP set and the remaining expiry; messages waiting on PUBCOMP get their
    /// PUBREL again. Expired entries are skipped; call [`Self::expire`] first.
    #[must_use]
    pub fn resume(&self, now: Instant) -> Vec<Packet> {
        let mut pending: Vec<&InFlightMessage> = self
            .entries
            .values()
            .filter(|entry| {
                entry.direction == Direction::Outbound
                    && !(entry.can_expire() && entry.is_expired(now))
            })
            .collect();
        pending.sort_by_key(|entry| entry.sequence);

        pending
            .into_iter()
            .map(|entry| match entry.state {
                DeliveryState::AwaitingPubComp => {
                    Packet::PubRel(PubRelPacket::new(entry.packet_id))
                }
                _ => {
                    let mut publish = entry.publish.clone().with_dup(true);
                    if let Some(remaining) = entry.remaining_expiry(now) {
                        publish = publish.with_message_expiry_interval(remaining);
                    }
                    Packet::Publish(publish)
                }
            })
            .collect()
    }

    /// Discards every entry and frees all identifiers
    pub fn reset(&mut self) {
        if !self.entries.is_empty() {
            debug!(entries = self.entries.len(), "Discarding in-flight state");
        }
        self.entries.clear();
        self.ids.clear();
    }

    /// Outbound QoS 1 and QoS 2 messages awaiting completion
    #[must_use]
    pub fn outbound_in_flight(&self) -> usize {
        self.entries
            .keys()
            .filter(|(direction, _)| *direction == Direction::Outbound)
            .count()
    }

    #[must_use]
    pub fn get(&self, direction: Direction, packet_id: u16) -> Option<&InFlightMessage> {
        self.entries.get(&(direction, packet_id))
    }

    /// Entries of one direction, most recent first
    #[must_use]
    pub fn entries(&self, direction: Direction) -> Vec<&InFlightMessage> {
        let mut selected: Vec<&InFlightMessage> = self
            .entries
            .values()
            .filter(|entry| entry.direction == direction)
            .collect();
        selected.sort_by_key(|entry| Reverse(entry.sequence));
        selected
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

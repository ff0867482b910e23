//! Connection lifecycle and session continuity
//!
//! [`SessionStateMachine`] does no I/O and reads no clock: callers pass in
//! the current [`Instant`] and send whatever packets it hands back.

use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::constants::defaults;
use crate::error::{MqttError, Result};
use crate::packet::connack::ConnAckPacket;
use crate::packet::connect::ConnectPacket;
use crate::packet::disconnect::DisconnectPacket;
use crate::packet::Packet;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::session::delivery::DeliveryTracker;
use crate::types::{ConnectOptions, ConnectResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// CONNACK refused the connection (`Some`) or the transport failed while connecting (`None`)
    ConnectFailed(Option<ReasonCode>),
}

/// Values negotiated for one live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Effective keep-alive, zero when disabled
    pub keep_alive: Duration,
    pub assigned_client_id: Option<String>,
    /// Outbound QoS 1/2 messages the broker accepts concurrently
    pub receive_maximum: u16,
    /// Largest packet the broker accepts
    pub maximum_packet_size: Option<u32>,
}

/// What the keep-alive timer should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Disabled,
    /// Nothing due; check again at the given instant
    Wait(Instant),
    SendPing,
    /// No response within one keep-alive interval of the last PINGREQ
    TimedOut,
}

/// Packets and events produced by a CONNACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAckOutcome {
    pub result: ConnectResult,
    /// Retransmissions for a resumed session, in original order
    pub resend: Vec<Packet>,
    /// Identifiers of resumed messages that expired while disconnected
    pub expired: Vec<u16>,
}

#[derive(Debug)]
pub struct SessionStateMachine {
    client_id: String,
    state: ConnectionState,
    clean_start: bool,
    session_present: bool,
    /// Interval sent in the last CONNECT
    requested_expiry: u32,
    /// Interval in force after CONNACK and DISCONNECT overrides
    session_expiry: u32,
    requested_keep_alive: Duration,
    context: Option<ConnectionContext>,
    tracker: DeliveryTracker,
    last_sent: Option<Instant>,
    ping_sent_at: Option<Instant>,
}

impl SessionStateMachine {
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            state: ConnectionState::Disconnected,
            clean_start: true,
            session_present: false,
            requested_expiry: 0,
            session_expiry: 0,
            requested_keep_alive: Duration::ZERO,
            context: None,
            tracker: DeliveryTracker::new(),
            last_sent: None,
            ping_sent_at: None,
        }
    }

    /// Builds the CONNECT packet and moves to `Connecting`
    ///
    /// # Errors
    ///
    /// `AlreadyConnected` while connecting or connected, `InvalidState` while
    /// disconnecting, `InvalidClientId` for an empty client id without clean start
    pub fn begin_connect(&mut self, options: &ConnectOptions) -> Result<ConnectPacket> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                return Err(MqttError::AlreadyConnected)
            }
            ConnectionState::Disconnecting => {
                return Err(MqttError::InvalidState(
                    "Disconnect still in progress".to_string(),
                ))
            }
            ConnectionState::Disconnected | ConnectionState::ConnectFailed(_) => {}
        }
        if self.client_id.is_empty() && !options.clean_start {
            return Err(MqttError::InvalidClientId(
                "An empty client identifier requires clean start".to_string(),
            ));
        }

        let mut packet = ConnectPacket::new(self.client_id.clone())
            .with_clean_start(options.clean_start)
            .with_keep_alive(options.keep_alive_secs());
        if let Some(seconds) = options.session_expiry_interval {
            packet = packet.with_session_expiry_interval(seconds);
        }
        if let Some(max) = options.receive_maximum {
            packet.properties.set_receive_maximum(max);
        }
        if let Some(size) = options.maximum_packet_size {
            packet.properties.set_maximum_packet_size(size);
        }
        for (key, value) in &options.user_properties {
            packet.properties.add_user_property(key.clone(), value.clone());
        }
        packet.username.clone_from(&options.username);
        packet.password = options.password.clone().map(Into::into);
        packet.will = options.will.as_ref().map(crate::types::WillMessage::to_last_will);

        self.clean_start = options.clean_start;
        self.requested_expiry = packet.session_expiry_interval();
        self.session_expiry = self.requested_expiry;
        self.requested_keep_alive = Duration::from_secs(u64::from(packet.keep_alive));
        self.session_present = false;
        self.transition(ConnectionState::Connecting);
        Ok(packet)
    }

    /// Applies the broker's CONNACK
    ///
    /// On success the connection context is built from the broker's overrides.
    /// A clean start or an absent session discards tracked state; a resumed
    /// session expires what lapsed while offline and returns retransmissions.
    ///
    /// # Errors
    ///
    /// `ProtocolError` if no CONNECT is outstanding, if the broker reports a
    /// present session after a clean start, if no client id is known after an
    /// empty one was sent, or if the receive maximum is zero
    pub fn on_connack(&mut self, connack: &ConnAckPacket, now: Instant) -> Result<ConnAckOutcome> {
        if self.state != ConnectionState::Connecting {
            return Err(MqttError::ProtocolError(format!(
                "CONNACK received in state {:?}",
                self.state
            )));
        }

        if connack.reason_code != ReasonCode::Success {
            warn!(reason = ?connack.reason_code, "Broker refused connection");
            self.transition(ConnectionState::ConnectFailed(Some(connack.reason_code)));
            return Ok(ConnAckOutcome {
                result: ConnectResult {
                    session_present: false,
                    assigned_client_id: None,
                    reason_code: connack.reason_code,
                },
                resend: Vec::new(),
                expired: Vec::new(),
            });
        }

        if self.clean_start && connack.session_present {
            return Err(MqttError::ProtocolError(
                "Session present after clean start".to_string(),
            ));
        }
        let properties = &connack.properties;
        let assigned_client_id = properties.assigned_client_identifier().map(str::to_string);
        if let Some(id) = &assigned_client_id {
            debug!(client_id = %id, "Broker assigned client identifier");
            self.client_id.clone_from(id);
        }
        if self.client_id.is_empty() {
            return Err(MqttError::ProtocolError(
                "No client identifier assigned".to_string(),
            ));
        }
        let receive_maximum = properties
            .receive_maximum()
            .unwrap_or(defaults::RECEIVE_MAXIMUM);
        if receive_maximum == 0 {
            return Err(MqttError::ProtocolError("Receive maximum of 0".to_string()));
        }

        let keep_alive = properties
            .server_keep_alive()
            .map_or(self.requested_keep_alive, |seconds| {
                Duration::from_secs(u64::from(seconds))
            });
        if let Some(seconds) = properties.session_expiry_interval() {
            self.session_expiry = seconds;
        }
        self.context = Some(ConnectionContext {
            keep_alive,
            assigned_client_id: assigned_client_id.clone(),
            receive_maximum,
            maximum_packet_size: properties.maximum_packet_size(),
        });
        self.session_present = connack.session_present;

        let (resend, expired) = if connack.session_present {
            let expired = self
                .tracker
                .expire(now)
                .into_iter()
                .map(|entry| entry.packet_id)
                .collect();
            (self.tracker.resume(now), expired)
        } else {
            self.tracker.reset();
            (Vec::new(), Vec::new())
        };

        self.last_sent = Some(now);
        self.ping_sent_at = None;
        self.transition(ConnectionState::Connected);
        info!(
            client_id = %self.client_id,
            session_present = connack.session_present,
            resumed = resend.len(),
            "Connected"
        );

        Ok(ConnAckOutcome {
            result: ConnectResult {
                session_present: connack.session_present,
                assigned_client_id,
                reason_code: ReasonCode::Success,
            },
            resend,
            expired,
        })
    }

    /// Builds the DISCONNECT packet and moves to `Disconnecting`
    ///
    /// `expiry_override` changes how long the broker keeps the session after
    /// this disconnect.
    ///
    /// # Errors
    ///
    /// `NotConnected` unless connected; `ProtocolError` for a non-zero
    /// override when CONNECT asked for an expiry of 0
    pub fn begin_disconnect(&mut self, expiry_override: Option<u32>) -> Result<DisconnectPacket> {
        if self.state != ConnectionState::Connected {
            return Err(MqttError::NotConnected);
        }
        let mut packet = DisconnectPacket::normal();
        if let Some(seconds) = expiry_override {
            if seconds != 0 && self.requested_expiry == 0 {
                return Err(MqttError::ProtocolError(
                    "Session expiry cannot be raised from 0 on disconnect".to_string(),
                ));
            }
            packet = packet.with_session_expiry_interval(seconds);
            self.session_expiry = seconds;
        }
        self.transition(ConnectionState::Disconnecting);
        Ok(packet)
    }

    /// Records the end of the transport
    ///
    /// Tracked state survives only if the session outlives the connection.
    pub fn on_transport_closed(&mut self) {
        let next = match self.state {
            ConnectionState::Connecting => ConnectionState::ConnectFailed(None),
            ConnectionState::ConnectFailed(code) => ConnectionState::ConnectFailed(code),
            _ => ConnectionState::Disconnected,
        };
        if self.session_expiry == 0 {
            self.tracker.reset();
        }
        self.context = None;
        self.last_sent = None;
        self.ping_sent_at = None;
        self.transition(next);
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Session state change");
            self.state = next;
        }
    }

    /// # Errors
    ///
    /// `NotConnected` unless the session is connected
    pub fn ensure_connected(&self) -> Result<&ConnectionContext> {
        match (&self.state, &self.context) {
            (ConnectionState::Connected, Some(context)) => Ok(context),
            _ => Err(MqttError::NotConnected),
        }
    }

    /// Any packet written to the transport
    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// Any packet read from the transport
    pub fn record_received(&mut self) {
        self.ping_sent_at = None;
    }

    pub fn record_ping_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
        self.ping_sent_at = Some(now);
    }

    #[must_use]
    pub fn keep_alive_action(&self, now: Instant) -> KeepAliveAction {
        let Some(context) = &self.context else {
            return KeepAliveAction::Disabled;
        };
        if self.state != ConnectionState::Connected || context.keep_alive.is_zero() {
            return KeepAliveAction::Disabled;
        }
        if let Some(sent) = self.ping_sent_at {
            let deadline = sent + context.keep_alive;
            return if now >= deadline {
                KeepAliveAction::TimedOut
            } else {
                KeepAliveAction::Wait(deadline)
            };
        }
        let due = self.last_sent.unwrap_or(now) + context.keep_alive;
        if now >= due {
            KeepAliveAction::SendPing
        } else {
            KeepAliveAction::Wait(due)
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn context(&self) -> Option<&ConnectionContext> {
        self.context.as_ref()
    }

    #[must_use]
    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut DeliveryTracker {
        &mut self.tracker
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn session_present(&self) -> bool {
        self.session_present
    }

    /// Session expiry interval currently in force
    #[must_use]
    pub fn session_expiry_interval(&self) -> u32 {
        self.session_expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::publish::PublishPacket;
    use crate::session::delivery::{Direction, PubRecOutcome};
    use crate::QoS;

    fn connected(options: &ConnectOptions, connack: &ConnAckPacket, now: Instant) -> SessionStateMachine {
        let mut machine = SessionStateMachine::new(options.client_id.clone());
        machine.begin_connect(options).unwrap();
        machine.on_connack(connack, now).unwrap();
        machine
    }

    #[test]
    fn test_clean_start_connect() {
        let now = Instant::now();
        let options = ConnectOptions::new("c1").with_session_expiry_interval(300);
        let mut machine = SessionStateMachine::new("c1");

        let connect = machine.begin_connect(&options).unwrap();
        assert!(connect.clean_start);
        assert_eq!(connect.session_expiry_interval(), 300);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.begin_connect(&options), Err(MqttError::AlreadyConnected));

        let outcome = machine
            .on_connack(&ConnAckPacket::new(false, ReasonCode::Success), now)
            .unwrap();
        assert!(!outcome.result.session_present);
        assert!(outcome.resend.is_empty());
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert_eq!(machine.session_expiry_interval(), 300);
        assert_eq!(machine.begin_connect(&options), Err(MqttError::AlreadyConnected));
    }

    #[test]
    fn test_refused_connect() {
        let now = Instant::now();
        let mut machine = SessionStateMachine::new("c1");
        machine.begin_connect(&ConnectOptions::new("c1")).unwrap();
        let outcome = machine
            .on_connack(&ConnAckPacket::new(false, ReasonCode::NotAuthorized), now)
            .unwrap();
        assert_eq!(outcome.result.reason_code, ReasonCode::NotAuthorized);
        assert_eq!(
            machine.state(),
            ConnectionState::ConnectFailed(Some(ReasonCode::NotAuthorized))
        );
        assert!(machine.ensure_connected().is_err());
        // a failed attempt may be retried
        assert!(machine.begin_connect(&ConnectOptions::new("c1")).is_ok());
    }

    #[test]
    fn test_transport_failure_while_connecting() {
        let mut machine = SessionStateMachine::new("c1");
        machine.begin_connect(&ConnectOptions::new("c1")).unwrap();
        machine.on_transport_closed();
        assert_eq!(machine.state(), ConnectionState::ConnectFailed(None));
    }

    #[test]
    fn test_unexpected_connack() {
        let mut machine = SessionStateMachine::new("c1");
        let result = machine.on_connack(&ConnAckPacket::new(false, ReasonCode::Success), Instant::now());
        assert!(matches!(result, Err(MqttError::ProtocolError(_))));
    }

    #[test]
    fn test_session_present_after_clean_start_is_rejected() {
        let mut machine = SessionStateMachine::new("c1");
        machine.begin_connect(&ConnectOptions::new("c1")).unwrap();
        let result = machine.on_connack(&ConnAckPacket::new(true, ReasonCode::Success), Instant::now());
        assert!(matches!(result, Err(MqttError::ProtocolError(_))));
    }

    #[test]
    fn test_assigned_client_id() {
        let now = Instant::now();
        let options = ConnectOptions::new("");
        let machine = connected(
            &options,
            &ConnAckPacket::new(false, ReasonCode::Success).with_assigned_client_id("auto-1"),
            now,
        );
        assert_eq!(machine.client_id(), "auto-1");
        assert_eq!(
            machine.context().unwrap().assigned_client_id.as_deref(),
            Some("auto-1")
        );

        let mut machine = SessionStateMachine::new("");
        machine.begin_connect(&options).unwrap();
        assert!(machine
            .on_connack(&ConnAckPacket::new(false, ReasonCode::Success), now)
            .is_err());
    }

    #[test]
    fn test_empty_client_id_requires_clean_start() {
        let mut machine = SessionStateMachine::new("");
        let options = ConnectOptions::new("").with_clean_start(false);
        assert!(matches!(
            machine.begin_connect(&options),
            Err(MqttError::InvalidClientId(_))
        ));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_server_overrides() {
        let now = Instant::now();
        let options = ConnectOptions::new("c1")
            .with_keep_alive(Duration::from_secs(60))
            .with_session_expiry_interval(600);
        let connack = ConnAckPacket::new(false, ReasonCode::Success)
            .with_server_keep_alive(15)
            .with_receive_maximum(10)
            .with_maximum_packet_size(1024)
            .with_session_expiry_interval(120);
        let machine = connected(&options, &connack, now);
        let context = machine.context().unwrap();
        assert_eq!(context.keep_alive, Duration::from_secs(15));
        assert_eq!(context.receive_maximum, 10);
        assert_eq!(context.maximum_packet_size, Some(1024));
        assert_eq!(machine.session_expiry_interval(), 120);
    }

    #[test]
    fn test_zero_receive_maximum_is_protocol_error() {
        let mut machine = SessionStateMachine::new("c1");
        machine.begin_connect(&ConnectOptions::new("c1")).unwrap();
        let connack = ConnAckPacket::new(false, ReasonCode::Success).with_receive_maximum(0);
        assert!(matches!(
            machine.on_connack(&connack, Instant::now()),
            Err(MqttError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_disconnect_with_override() {
        let now = Instant::now();
        let options = ConnectOptions::new("c1").with_session_expiry_interval(300);
        let mut machine = connected(&options, &ConnAckPacket::new(false, ReasonCode::Success), now);

        let packet = machine.begin_disconnect(Some(0)).unwrap();
        assert_eq!(packet.properties.session_expiry_interval(), Some(0));
        assert_eq!(machine.state(), ConnectionState::Disconnecting);
        assert_eq!(machine.begin_disconnect(None), Err(MqttError::NotConnected));

        machine.on_transport_closed();
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_cannot_raise_zero_expiry() {
        let now = Instant::now();
        let options = ConnectOptions::new("c1");
        let mut machine = connected(&options, &ConnAckPacket::new(false, ReasonCode::Success), now);
        assert!(matches!(
            machine.begin_disconnect(Some(60)),
            Err(MqttError::ProtocolError(_))
        ));
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(machine.begin_disconnect(Some(0)).is_ok());
    }

    #[test]
    fn test_disconnect_requires_connection() {
        let mut machine = SessionStateMachine::new("c1");
        assert_eq!(machine.begin_disconnect(None), Err(MqttError::NotConnected));
    }

    fn track_qos2(machine: &mut SessionStateMachine, id: u16, now: Instant) {
        let publish = PublishPacket::new("x/demo", &b"resume"[..]).with_qos(QoS::ExactlyOnce, id);
        machine.tracker_mut().track_outbound(publish, now).unwrap();
    }

    #[test]
    fn test_resumed_session_keeps_tracker() {
        let now = Instant::now();
        let options = ConnectOptions::new("c1").with_session_expiry_interval(300);
        let mut machine = connected(&options, &ConnAckPacket::new(false, ReasonCode::Success), now);
        track_qos2(&mut machine, 1, now);
        track_qos2(&mut machine, 2, now);
        assert_eq!(
            machine.tracker_mut().on_pubrec(2, ReasonCode::Success),
            PubRecOutcome::Release(2)
        );
        machine.on_transport_closed();
        assert_eq!(machine.tracker().len(), 2);

        let resume = options.clone().with_clean_start(false);
        machine.begin_connect(&resume).unwrap();
        let outcome = machine
            .on_connack(&ConnAckPacket::new(true, ReasonCode::Success), now)
            .unwrap();
        assert!(machine.session_present());
        assert_eq!(outcome.resend.len(), 2);
        assert!(matches!(&outcome.resend[0], Packet::Publish(p) if p.dup && p.packet_id == Some(1)));
        assert!(matches!(&outcome.resend[1], Packet::PubRel(p) if p.packet_id == 2));
        assert!(machine.tracker().get(Direction::Outbound, 2).is_some());
    }

    #[test]
    fn test_resume_without_broker_session_discards_tracker() {
        let now = Instant::now();
        let options = ConnectOptions::new("c1").with_session_expiry_interval(300);
        let mut machine = connected(&options, &ConnAckPacket::new(false, ReasonCode::Success), now);
        track_qos2(&mut machine, 1, now);
        machine.on_transport_closed();

        machine.begin_connect(&options.clone().with_clean_start(false)).unwrap();
        let outcome = machine
            .on_connack(&ConnAckPacket::new(false, ReasonCode::Success), now)
            .unwrap();
        assert!(outcome.resend.is_empty());
        assert!(machine.tracker().is_empty());
    }

    #[test]
    fn test_zero_expiry_discards_tracker_on_close() {
        let now = Instant::now();
        let options = ConnectOptions::new("c1");
        let mut machine = connected(&options, &ConnAckPacket::new(false, ReasonCode::Success), now);
        track_qos2(&mut machine, 1, now);
        machine.on_transport_closed();
        assert!(machine.tracker().is_empty());
    }

    #[test]
    fn test_resume_expires_lapsed_messages() {
        let now = Instant::now();
        let options = ConnectOptions::new("c1").with_session_expiry_interval(300);
        let mut machine = connected(&options, &ConnAckPacket::new(false, ReasonCode::Success), now);
        let publish = PublishPacket::new("x/demo", &b"short"[..])
            .with_qos(QoS::AtLeastOnce, 1)
            .with_message_expiry_interval(5);
        machine.tracker_mut().track_outbound(publish, now).unwrap();
        machine.on_transport_closed();

        machine.begin_connect(&options.clone().with_clean_start(false)).unwrap();
        let outcome = machine
            .on_connack(
                &ConnAckPacket::new(true, ReasonCode::Success),
                now + Duration::from_secs(6),
            )
            .unwrap();
        assert_eq!(outcome.expired, vec![1]);
        assert!(outcome.resend.is_empty());
    }

    #[test]
    fn test_keep_alive_schedule() {
        let now = Instant::now();
        let options = ConnectOptions::new("c1").with_keep_alive(Duration::from_secs(10));
        let mut machine = connected(&options, &ConnAckPacket::new(false, ReasonCode::Success), now);

        assert_eq!(
            machine.keep_alive_action(now),
            KeepAliveAction::Wait(now + Duration::from_secs(10))
        );
        machine.record_sent(now + Duration::from_secs(4));
        assert_eq!(
            machine.keep_alive_action(now + Duration::from_secs(10)),
            KeepAliveAction::Wait(now + Duration::from_secs(14))
        );

        let ping_at = now + Duration::from_secs(14);
        assert_eq!(machine.keep_alive_action(ping_at), KeepAliveAction::SendPing);
        machine.record_ping_sent(ping_at);
        assert_eq!(
            machine.keep_alive_action(ping_at + Duration::from_secs(9)),
            KeepAliveAction::Wait(ping_at + Duration::from_secs(10))
        );
        assert_eq!(
            machine.keep_alive_action(ping_at + Duration::from_secs(10)),
            KeepAliveAction::TimedOut
        );

        machine.record_received();
        assert_eq!(
            machine.keep_alive_action(ping_at + Duration::from_secs(10)),
            KeepAliveAction::SendPing
        );
    }

    #[test]
    fn test_keep_alive_disabled() {
        let now = Instant::now();
        let options = ConnectOptions::new("c1").with_keep_alive(Duration::ZERO);
        let machine = connected(&options, &ConnAckPacket::new(false, ReasonCode::Success), now);
        assert_eq!(machine.keep_alive_action(now), KeepAliveAction::Disabled);
        assert_eq!(
            SessionStateMachine::new("idle").keep_alive_action(now),
            KeepAliveAction::Disabled
        );
    }
}

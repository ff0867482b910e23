//! Shared session core and the background reader and timer tasks
//!
//! Every touch of session or delivery state goes through `Shared::core`.
//! Application calls and the reader task take the same lock, so packet
//! handling and API calls interleave but never overlap.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::error::{MqttError, Result};
use crate::packet::codec::encode_packet;
use crate::packet::connack::ConnAckPacket;
use crate::packet::connect::ConnectPacket;
use crate::packet::disconnect::DisconnectPacket;
use crate::packet::puback::PubAckPacket;
use crate::packet::pubcomp::PubCompPacket;
use crate::packet::publish::PublishPacket;
use crate::packet::pubrec::PubRecPacket;
use crate::packet::pubrel::PubRelPacket;
use crate::packet::suback::SubAckPacket;
use crate::packet::subscribe::{SubscribePacket, TopicFilter};
use crate::packet::unsuback::UnsubAckPacket;
use crate::packet::unsubscribe::UnsubscribePacket;
use crate::packet::Packet;
use crate::protocol::v5::reason_codes::ReasonCode;
use crate::session::delivery::seconds_rounded_up;
use crate::session::{
    ConnectionState, InboundAction, KeepAliveAction, PubRecOutcome, PubRelOutcome,
    SessionStateMachine,
};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::{PacketReader, PacketWriter, Transport};
use crate::types::{ConnectOptions, ConnectResult, Message, PublishOptions, PublishOutcome};
use crate::QoS;

type BoxedWriter = PacketWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// A caller blocked on an acknowledgment
enum Waiter {
    /// `reason` holds the PUBREC code while a QoS 2 message waits on PUBCOMP
    Publish {
        tx: oneshot::Sender<Result<ReasonCode>>,
        reason: ReasonCode,
    },
    Subscribe(oneshot::Sender<Result<SubAckPacket>>),
    Unsubscribe(oneshot::Sender<Result<UnsubAckPacket>>),
}

impl Waiter {
    fn fail(self, error: MqttError) {
        match self {
            Self::Publish { tx, .. } => {
                let _ = tx.send(Err(error));
            }
            Self::Subscribe(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Unsubscribe(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }

    fn is_publish(&self) -> bool {
        matches!(self, Self::Publish { .. })
    }
}

pub(crate) struct Core {
    pub(crate) machine: SessionStateMachine,
    writer: Option<BoxedWriter>,
    pending: HashMap<u16, Waiter>,
    tasks: Vec<JoinHandle<()>>,
    /// Tells the reader to stop once it is between packets
    reader_stop: Option<oneshot::Sender<()>>,
    /// Bumped on every connect and teardown so stale tasks can tell
    generation: u64,
    pub(crate) last_disconnect_reason: Option<ReasonCode>,
}

impl Core {
    async fn send(&mut self, packet: &Packet) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(MqttError::NotConnected)?;
        writer.write_packet(packet).await?;
        self.machine.record_sent(Instant::now());
        Ok(())
    }

    fn resolve_publish(&mut self, packet_id: u16, result: Result<ReasonCode>) {
        match self.pending.remove(&packet_id) {
            Some(Waiter::Publish { tx, .. }) => {
                let _ = tx.send(result);
            }
            Some(other) => {
                self.pending.insert(packet_id, other);
            }
            None => trace!(packet_id, "No caller waiting on publish"),
        }
    }

    fn record_pubrec(&mut self, packet_id: u16, code: ReasonCode) {
        if let Some(Waiter::Publish { reason, .. }) = self.pending.get_mut(&packet_id) {
            *reason = code;
        }
    }

    fn complete_qos2(&mut self, packet_id: u16, pubcomp_code: ReasonCode) {
        let reason = match self.pending.get(&packet_id) {
            Some(Waiter::Publish { reason, .. }) if pubcomp_code == ReasonCode::Success => *reason,
            _ => pubcomp_code,
        };
        self.resolve_publish(packet_id, Ok(reason));
    }

    fn resolve_suback(&mut self, suback: SubAckPacket) {
        let packet_id = suback.packet_id;
        match self.pending.remove(&packet_id) {
            Some(Waiter::Subscribe(tx)) => {
                self.machine.tracker_mut().release_id(packet_id);
                let _ = tx.send(Ok(suback));
            }
            Some(other) => {
                self.pending.insert(packet_id, other);
                debug!(packet_id, "SUBACK does not match a pending SUBSCRIBE");
            }
            None => debug!(packet_id, "SUBACK without pending SUBSCRIBE"),
        }
    }

    fn resolve_unsuback(&mut self, unsuback: UnsubAckPacket) {
        let packet_id = unsuback.packet_id;
        match self.pending.remove(&packet_id) {
            Some(Waiter::Unsubscribe(tx)) => {
                self.machine.tracker_mut().release_id(packet_id);
                let _ = tx.send(Ok(unsuback));
            }
            Some(other) => {
                self.pending.insert(packet_id, other);
                debug!(packet_id, "UNSUBACK does not match a pending UNSUBSCRIBE");
            }
            None => debug!(packet_id, "UNSUBACK without pending UNSUBSCRIBE"),
        }
    }

    /// Ends the current connection
    ///
    /// Sends `farewell` if given, closes the stream, fails every waiter with
    /// `ConnectionLost` and stops the background tasks. The timer task is
    /// aborted last, so it may call this on itself as its final step. The
    /// reader is only signalled, so a message it is handing to the
    /// `MessageStream` is still delivered.
    async fn close(&mut self, farewell: Option<DisconnectPacket>) {
        if let Some(mut writer) = self.writer.take() {
            if let Some(packet) = farewell {
                if let Err(e) = writer.write_packet(&Packet::Disconnect(packet)).await {
                    debug!(error = %e, "Could not send DISCONNECT");
                }
            }
            let _ = writer.close().await;
        }
        self.machine.on_transport_closed();

        for (packet_id, waiter) in self.pending.drain() {
            if !waiter.is_publish() {
                self.machine.tracker_mut().release_id(packet_id);
            }
            waiter.fail(MqttError::ConnectionLost);
        }
        self.generation += 1;
        if let Some(stop) = self.reader_stop.take() {
            let _ = stop.send(());
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

pub(crate) struct Shared {
    pub(crate) options: ConnectOptions,
    pub(crate) core: Mutex<Core>,
    /// Signalled when a packet identifier or in-flight slot frees up
    slots: Notify,
    /// Wakes the timer task when a new expiry deadline is tracked
    timer: Notify,
    messages: mpsc::Sender<Message>,
}

/// DISCONNECT reason to send before dropping a broker that broke the protocol
fn farewell_for(error: &MqttError) -> Option<DisconnectPacket> {
    let code = match error {
        MqttError::MalformedPacket(_) => ReasonCode::MalformedPacket,
        MqttError::ProtocolError(_) => ReasonCode::ProtocolError,
        MqttError::PacketTooLarge { .. } => ReasonCode::PacketTooLarge,
        _ => return None,
    };
    Some(DisconnectPacket::new(code))
}

fn check_packet_size(packet: &Packet, maximum: Option<u32>) -> Result<()> {
    let Some(max) = maximum else {
        return Ok(());
    };
    let size = encode_packet(packet)?.len();
    if size > max as usize {
        return Err(MqttError::PacketTooLarge {
            size,
            max: max as usize,
        });
    }
    Ok(())
}

async fn exchange_connect<R, W>(
    writer: &mut PacketWriter<W>,
    reader: &mut PacketReader<R>,
    connect: ConnectPacket,
    limit: Duration,
) -> Result<ConnAckPacket>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_packet(&Packet::Connect(Box::new(connect))).await?;
    match timeout(limit, reader.read_packet()).await?? {
        Packet::ConnAck(connack) => Ok(connack),
        other => Err(MqttError::ProtocolError(format!(
            "Expected CONNACK, received {:?}",
            other.packet_type()
        ))),
    }
}

impl Shared {
    pub(crate) fn new(options: ConnectOptions, messages: mpsc::Sender<Message>) -> Self {
        let machine = SessionStateMachine::new(options.client_id.clone());
        Self {
            options,
            core: Mutex::new(Core {
                machine,
                writer: None,
                pending: HashMap::new(),
                tasks: Vec::new(),
                reader_stop: None,
                generation: 0,
                last_disconnect_reason: None,
            }),
            slots: Notify::new(),
            timer: Notify::new(),
            messages,
        }
    }

    pub(crate) async fn connect<T: Transport>(self: &Arc<Self>, transport: T) -> Result<ConnectResult> {
        let connect = self.core.lock().await.machine.begin_connect(&self.options)?;

        let (read_half, write_half) = tokio::io::split(transport);
        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        let mut writer: BoxedWriter = PacketWriter::new(write_half);
        let mut reader = PacketReader::new(read_half)
            .with_maximum_packet_size(self.options.maximum_packet_size);

        let exchanged =
            exchange_connect(&mut writer, &mut reader, connect, self.options.timeouts.connack).await;
        let mut core = self.core.lock().await;
        let outcome = match exchanged.and_then(|connack| core.machine.on_connack(&connack, Instant::now())) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Connect failed");
                if let Some(packet) = farewell_for(&e) {
                    let _ = writer.write_packet(&Packet::Disconnect(packet)).await;
                }
                let _ = writer.close().await;
                core.machine.on_transport_closed();
                return Err(e);
            }
        };

        if !outcome.result.is_success() {
            let _ = writer.close().await;
            core.machine.on_transport_closed();
            return Ok(outcome.result);
        }

        for packet_id in &outcome.expired {
            warn!(packet_id, "Message expired while the session was offline");
        }
        core.writer = Some(writer);
        core.generation += 1;
        let generation = core.generation;

        for packet in &outcome.resend {
            debug!(packet_type = ?packet.packet_type(), packet_id = ?packet.packet_id(), "Resending");
            if let Err(e) = core.send(packet).await {
                error!(error = %e, "Resend failed");
                core.close(None).await;
                return Err(e);
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        core.reader_stop = Some(stop_tx);
        tokio::spawn(reader_task(Arc::clone(self), reader, stop_rx, generation));
        core.tasks
            .push(tokio::spawn(timer_task(Arc::clone(self), generation)));
        Ok(outcome.result)
    }

    /// Waits until a packet identifier is free, returning it with the lock held
    ///
    /// For publishes the broker's receive maximum bounds the in-flight count too.
    /// A caller that was waiting when the connection closed gets `ConnectionLost`.
    async fn acquire_packet_id(&self, publishing: bool) -> Result<(MutexGuard<'_, Core>, u16)> {
        let mut waiting_on = None;
        loop {
            let mut core = self.core.lock().await;
            match waiting_on {
                Some(generation) if generation != core.generation => {
                    return Err(MqttError::ConnectionLost);
                }
                Some(_) => {}
                None => waiting_on = Some(core.generation),
            }
            let receive_maximum = core.machine.ensure_connected()?.receive_maximum;
            let has_slot = !publishing
                || core.machine.tracker().outbound_in_flight() < usize::from(receive_maximum);
            if has_slot {
                if let Some(packet_id) = core.machine.tracker_mut().allocate_id() {
                    return Ok((core, packet_id));
                }
            }

            debug!(publishing, "Waiting for a free packet identifier");
            let notified = self.slots.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(core);
            notified.await;
        }
    }

    async fn fail_locked(&self, mut core: MutexGuard<'_, Core>, error: &MqttError) {
        error!(error = %error, "Connection failed");
        core.close(farewell_for(error)).await;
        drop(core);
        self.slots.notify_waiters();
    }

    pub(crate) async fn publish(
        &self,
        topic: &str,
        payload: bytes::Bytes,
        options: PublishOptions,
    ) -> Result<PublishOutcome> {
        validate_topic_name(topic)?;
        let published_at = Instant::now();
        let mut publish = PublishPacket::new(topic, payload).with_retain(options.retain);
        publish.properties = options.to_properties();

        if options.qos == QoS::AtMostOnce {
            let mut core = self.core.lock().await;
            let maximum = core.machine.ensure_connected()?.maximum_packet_size;
            let packet = Packet::Publish(publish);
            check_packet_size(&packet, maximum)?;
            if let Err(e) = core.send(&packet).await {
                self.fail_locked(core, &e).await;
                return Err(e);
            }
            return Ok(PublishOutcome {
                packet_id: None,
                reason_code: ReasonCode::Success,
            });
        }

        let (mut core, packet_id) = self.acquire_packet_id(true).await?;
        let maximum = core.machine.ensure_connected()?.maximum_packet_size;
        let publish = publish.with_qos(options.qos, packet_id);
        let mut outgoing = publish.clone();
        if let Some(seconds) = options.message_expiry_interval {
            let deadline = published_at + Duration::from_secs(u64::from(seconds));
            let now = Instant::now();
            if deadline <= now {
                core.machine.tracker_mut().release_id(packet_id);
                drop(core);
                self.slots.notify_waiters();
                warn!(packet_id, "Message expired while waiting for an in-flight slot");
                return Err(MqttError::Expired { packet_id: None });
            }
            outgoing = outgoing.with_message_expiry_interval(seconds_rounded_up(deadline - now));
        }
        let packet = Packet::Publish(outgoing);
        if let Err(e) = check_packet_size(&packet, maximum) {
            core.machine.tracker_mut().release_id(packet_id);
            return Err(e);
        }
        if let Err(e) = core.machine.tracker_mut().track_outbound(publish, published_at) {
            core.machine.tracker_mut().release_id(packet_id);
            return Err(e);
        }
        if let Err(e) = core.send(&packet).await {
            self.fail_locked(core, &e).await;
            return Err(e);
        }
        let (tx, rx) = oneshot::channel();
        core.pending.insert(
            packet_id,
            Waiter::Publish {
                tx,
                reason: ReasonCode::Success,
            },
        );
        drop(core);
        self.timer.notify_one();

        let received = match self.options.timeouts.ack {
            Some(limit) => {
                if let Ok(received) = timeout(limit, rx).await {
                    received
                } else {
                    self.core.lock().await.pending.remove(&packet_id);
                    warn!(packet_id, "Timed out waiting for acknowledgment");
                    return Err(MqttError::Timeout);
                }
            }
            None => rx.await,
        };
        let reason_code = received??;
        Ok(PublishOutcome {
            packet_id: Some(packet_id),
            reason_code,
        })
    }

    pub(crate) async fn subscribe(&self, filters: Vec<TopicFilter>) -> Result<SubAckPacket> {
        if filters.is_empty() {
            return Err(MqttError::ProtocolError(
                "SUBSCRIBE needs at least one topic filter".to_string(),
            ));
        }
        for filter in &filters {
            validate_topic_filter(&filter.filter)?;
        }

        let (mut core, packet_id) = self.acquire_packet_id(false).await?;
        let packet = Packet::Subscribe(SubscribePacket::new(packet_id, filters));
        if let Err(e) = core.send(&packet).await {
            core.machine.tracker_mut().release_id(packet_id);
            self.fail_locked(core, &e).await;
            return Err(e);
        }
        let (tx, rx) = oneshot::channel();
        core.pending.insert(packet_id, Waiter::Subscribe(tx));
        drop(core);

        match timeout(self.options.timeouts.subscribe, rx).await {
            Ok(received) => received?,
            Err(_) => {
                self.abandon_request(packet_id).await;
                warn!(packet_id, "Timed out waiting for SUBACK");
                Err(MqttError::Timeout)
            }
        }
    }

    pub(crate) async fn unsubscribe(&self, filters: Vec<String>) -> Result<UnsubAckPacket> {
        if filters.is_empty() {
            return Err(MqttError::ProtocolError(
                "UNSUBSCRIBE needs at least one topic filter".to_string(),
            ));
        }
        for filter in &filters {
            validate_topic_filter(filter)?;
        }

        let (mut core, packet_id) = self.acquire_packet_id(false).await?;
        let packet = Packet::Unsubscribe(UnsubscribePacket::new(packet_id, filters));
        if let Err(e) = core.send(&packet).await {
            core.machine.tracker_mut().release_id(packet_id);
            self.fail_locked(core, &e).await;
            return Err(e);
        }
        let (tx, rx) = oneshot::channel();
        core.pending.insert(packet_id, Waiter::Unsubscribe(tx));
        drop(core);

        match timeout(self.options.timeouts.subscribe, rx).await {
            Ok(received) => received?,
            Err(_) => {
                self.abandon_request(packet_id).await;
                warn!(packet_id, "Timed out waiting for UNSUBACK");
                Err(MqttError::Timeout)
            }
        }
    }

    /// Forgets a SUBSCRIBE or UNSUBSCRIBE whose acknowledgment never came
    async fn abandon_request(&self, packet_id: u16) {
        let mut core = self.core.lock().await;
        if core.pending.remove(&packet_id).is_some() {
            core.machine.tracker_mut().release_id(packet_id);
        }
        drop(core);
        self.slots.notify_waiters();
    }

    pub(crate) async fn disconnect(&self, expiry_override: Option<u32>) -> Result<()> {
        let mut core = self.core.lock().await;
        let packet = core.machine.begin_disconnect(expiry_override)?;
        info!(session_expiry = ?expiry_override, "Disconnecting");
        core.close(Some(packet)).await;
        drop(core);
        self.slots.notify_waiters();
        Ok(())
    }

    /// Tears down the connection a task belongs to, unless it was already replaced
    async fn fail_connection(&self, generation: u64, error: MqttError) {
        let mut core = self.core.lock().await;
        if core.generation != generation {
            return;
        }
        if error == MqttError::ConnectionLost {
            info!("Connection closed");
            core.close(None).await;
            drop(core);
            self.slots.notify_waiters();
        } else {
            self.fail_locked(core, &error).await;
        }
    }

    async fn handle_packet(&self, generation: u64, packet: Packet) -> Result<Vec<Message>> {
        let mut core = self.core.lock().await;
        if core.generation != generation {
            return Err(MqttError::ConnectionLost);
        }
        let now = Instant::now();
        core.machine.record_received();
        let mut deliveries = Vec::new();

        match packet {
            Packet::Publish(publish) => {
                if publish.topic_name.is_empty() {
                    return Err(MqttError::ProtocolError(
                        "PUBLISH without topic name".to_string(),
                    ));
                }
                trace!(topic = %publish.topic_name, qos = ?publish.qos, packet_id = ?publish.packet_id, "PUBLISH received");
                match core.machine.tracker_mut().on_inbound_publish(publish, now) {
                    InboundAction::Deliver(publish) => deliveries.push(Message::from(publish)),
                    InboundAction::AckAndDeliver(packet_id, publish) => {
                        core.send(&Packet::PubAck(PubAckPacket::new(packet_id)))
                            .await?;
                        deliveries.push(Message::from(publish));
                    }
                    InboundAction::Receive { packet_id, .. } => {
                        core.send(&Packet::PubRec(PubRecPacket::new(packet_id)))
                            .await?;
                    }
                }
            }
            Packet::PubRel(pubrel) => {
                let packet_id = pubrel.packet_id;
                let reply = match core.machine.tracker_mut().on_pubrel(packet_id, now) {
                    PubRelOutcome::Deliver(publish) => {
                        deliveries.push(Message::from(publish));
                        PubCompPacket::new(packet_id)
                    }
                    PubRelOutcome::Expired(_) => PubCompPacket::new(packet_id),
                    PubRelOutcome::Unknown => PubCompPacket::not_found(packet_id),
                };
                core.send(&Packet::PubComp(reply)).await?;
            }
            Packet::PubAck(puback) => {
                if core.machine.tracker_mut().on_puback(puback.packet_id).is_some() {
                    core.resolve_publish(puback.packet_id, Ok(puback.reason_code));
                    self.slots.notify_waiters();
                }
            }
            Packet::PubRec(pubrec) => {
                let packet_id = pubrec.packet_id;
                match core
                    .machine
                    .tracker_mut()
                    .on_pubrec(packet_id, pubrec.reason_code)
                {
                    PubRecOutcome::Release(packet_id) => {
                        core.record_pubrec(packet_id, pubrec.reason_code);
                        core.send(&Packet::PubRel(PubRelPacket::new(packet_id)))
                            .await?;
                    }
                    PubRecOutcome::Rejected(_) => {
                        core.resolve_publish(packet_id, Ok(pubrec.reason_code));
                        self.slots.notify_waiters();
                    }
                    PubRecOutcome::Unknown => {
                        let reply = PubRelPacket::new_with_reason(
                            packet_id,
                            ReasonCode::PacketIdentifierNotFound,
                        );
                        core.send(&Packet::PubRel(reply)).await?;
                    }
                }
            }
            Packet::PubComp(pubcomp) => {
                if core.machine.tracker_mut().on_pubcomp(pubcomp.packet_id).is_some() {
                    core.complete_qos2(pubcomp.packet_id, pubcomp.reason_code);
                    self.slots.notify_waiters();
                }
            }
            Packet::SubAck(suback) => {
                core.resolve_suback(suback);
                self.slots.notify_waiters();
            }
            Packet::UnsubAck(unsuback) => {
                core.resolve_unsuback(unsuback);
                self.slots.notify_waiters();
            }
            Packet::PingResp => trace!("PINGRESP received"),
            Packet::Disconnect(disconnect) => {
                warn!(
                    reason = ?disconnect.reason_code,
                    reason_string = ?disconnect.properties.reason_string(),
                    "Broker closed the connection"
                );
                core.last_disconnect_reason = Some(disconnect.reason_code);
                return Err(MqttError::ConnectionLost);
            }
            other => {
                return Err(MqttError::ProtocolError(format!(
                    "Unexpected {:?} from broker",
                    other.packet_type()
                )))
            }
        }
        Ok(deliveries)
    }

    pub(crate) async fn state(&self) -> ConnectionState {
        self.core.lock().await.machine.state()
    }
}

async fn reader_task<R: AsyncRead + Unpin>(
    shared: Arc<Shared>,
    mut reader: PacketReader<R>,
    mut stop: oneshot::Receiver<()>,
    generation: u64,
) {
    loop {
        let read = tokio::select! {
            biased;
            _ = &mut stop => {
                trace!("Reader stopped");
                return;
            }
            read = reader.read_packet() => read,
        };
        let handled = match read {
            Ok(packet) => shared.handle_packet(generation, packet).await,
            Err(e) => Err(e),
        };
        match handled {
            Ok(deliveries) => {
                for message in deliveries {
                    if shared.messages.send(message).await.is_err() {
                        debug!("Message stream dropped, discarding message");
                    }
                }
            }
            Err(e) => {
                shared.fail_connection(generation, e).await;
                return;
            }
        }
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Drives keep-alive pings and outbound message expiry
async fn timer_task(shared: Arc<Shared>, generation: u64) {
    loop {
        let wake_at = {
            let mut core = shared.core.lock().await;
            if core.generation != generation {
                return;
            }
            let now = Instant::now();

            let expired = core.machine.tracker_mut().expire(now);
            if !expired.is_empty() {
                for entry in expired {
                    core.resolve_publish(
                        entry.packet_id,
                        Err(MqttError::Expired {
                            packet_id: Some(entry.packet_id),
                        }),
                    );
                }
                shared.slots.notify_waiters();
            }

            let keep_alive = match core.machine.keep_alive_action(now) {
                KeepAliveAction::TimedOut => {
                    error!("No response from broker within keep-alive");
                    core.close(None).await;
                    drop(core);
                    shared.slots.notify_waiters();
                    return;
                }
                KeepAliveAction::SendPing => {
                    trace!("Sending PINGREQ");
                    if let Err(e) = core.send(&Packet::PingReq).await {
                        shared.fail_locked(core, &e).await;
                        return;
                    }
                    core.machine.record_ping_sent(now);
                    continue;
                }
                KeepAliveAction::Wait(at) => Some(at),
                KeepAliveAction::Disabled => None,
            };
            earliest(keep_alive, core.machine.tracker().next_expiry())
        };

        tokio::select! {
            () = sleep_until_or_forever(wake_at) => {}
            () = shared.timer.notified() => {}
        }
    }
}

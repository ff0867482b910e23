mod common;

use common::{pipe, ScriptedBroker};
use mqtt5_session::constants::defaults::MESSAGE_CHANNEL_CAPACITY;
use mqtt5_session::packet::connack::ConnAckPacket;
use mqtt5_session::packet::puback::PubAckPacket;
use mqtt5_session::packet::pubcomp::PubCompPacket;
use mqtt5_session::packet::pubrec::PubRecPacket;
use mqtt5_session::packet::pubrel::PubRelPacket;
use mqtt5_session::packet::suback::SubAckPacket;
use mqtt5_session::packet::unsuback::UnsubAckPacket;
use mqtt5_session::{
    ConnectOptions, MessageStream, MqttError, MqttSession, Packet, PublishOptions, PublishOutcome,
    PublishPacket, QoS, ReasonCode, SessionTimeouts,
};
use std::time::Duration;

async fn connected(options: ConnectOptions) -> (MqttSession, MessageStream, ScriptedBroker) {
    connected_with(options, ConnAckPacket::new(false, ReasonCode::Success)).await
}

async fn connected_with(
    options: ConnectOptions,
    connack: ConnAckPacket,
) -> (MqttSession, MessageStream, ScriptedBroker) {
    let (session, messages) = MqttSession::new(options);
    let (transport, mut broker) = pipe();
    let (result, _) = tokio::join!(session.connect(transport), broker.accept_with(connack));
    assert!(result.unwrap().is_success());
    (session, messages, broker)
}

fn expect_publish(packet: Packet) -> PublishPacket {
    match packet {
        Packet::Publish(publish) => publish,
        other => panic!("expected PUBLISH, got {other:?}"),
    }
}

#[tokio::test]
async fn test_qos0_publish_is_fire_and_forget() {
    let (session, _messages, mut broker) = connected(ConnectOptions::new("flow-qos0")).await;

    let outcome = session
        .publish("sensors/t", b"21.5".to_vec(), QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(outcome.packet_id, None);
    assert_eq!(session.in_flight().await, 0);

    let publish = expect_publish(broker.recv().await);
    assert_eq!(publish.topic_name, "sensors/t");
    assert_eq!(publish.packet_id, None);
    assert_eq!(&publish.payload[..], b"21.5");
}

#[tokio::test]
async fn test_qos1_publish_resolves_on_puback() {
    let (session, _messages, mut broker) = connected(ConnectOptions::new("flow-qos1")).await;

    let publisher = session.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish_with_options(
                "a/b",
                b"one".to_vec(),
                PublishOptions::new(QoS::AtLeastOnce)
                    .with_retain(true)
                    .with_content_type("text/plain"),
            )
            .await
    });

    let publish = expect_publish(broker.recv().await);
    assert_eq!(publish.packet_id, Some(1));
    assert!(publish.retain);
    assert!(!publish.dup);
    assert_eq!(publish.properties.content_type(), Some("text/plain"));

    broker
        .send(Packet::PubAck(PubAckPacket::new_with_reason(
            1,
            ReasonCode::NoMatchingSubscribers,
        )))
        .await;

    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        PublishOutcome {
            packet_id: Some(1),
            reason_code: ReasonCode::NoMatchingSubscribers,
        }
    );
    assert!(!outcome.is_error());
    assert_eq!(session.in_flight().await, 0);
}

#[tokio::test]
async fn test_qos2_publish_full_handshake() {
    let (session, _messages, mut broker) = connected(ConnectOptions::new("flow-qos2")).await;

    let publisher = session.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish("a/b", b"two".to_vec(), QoS::ExactlyOnce)
            .await
    });

    let publish = expect_publish(broker.recv().await);
    assert_eq!(publish.qos, QoS::ExactlyOnce);
    let packet_id = publish.packet_id.unwrap();

    broker.send(Packet::PubRec(PubRecPacket::new(packet_id))).await;
    match broker.recv().await {
        Packet::PubRel(pubrel) => {
            assert_eq!(pubrel.packet_id, packet_id);
            assert_eq!(pubrel.reason_code, ReasonCode::Success);
        }
        other => panic!("expected PUBREL, got {other:?}"),
    }
    assert_eq!(session.in_flight().await, 1);

    broker.send(Packet::PubComp(PubCompPacket::new(packet_id))).await;
    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome.packet_id, Some(packet_id));
    assert_eq!(outcome.reason_code, ReasonCode::Success);
    assert_eq!(session.in_flight().await, 0);
}

#[tokio::test]
async fn test_qos2_rejected_by_pubrec_sends_no_pubrel() {
    let (session, _messages, mut broker) = connected(ConnectOptions::new("flow-qos2-no")).await;

    let publisher = session.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish("a/b", b"two".to_vec(), QoS::ExactlyOnce)
            .await
    });
    let packet_id = expect_publish(broker.recv().await).packet_id.unwrap();
    broker
        .send(Packet::PubRec(PubRecPacket::new_with_reason(
            packet_id,
            ReasonCode::QuotaExceeded,
        )))
        .await;

    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome.reason_code, ReasonCode::QuotaExceeded);
    assert!(outcome.is_error());
    assert_eq!(session.in_flight().await, 0);
    assert!(broker
        .recv_within(Duration::from_millis(50))
        .await
        .is_none());
}

#[tokio::test]
async fn test_unknown_pubrec_is_answered_not_found() {
    let (_session, _messages, mut broker) = connected(ConnectOptions::new("flow-stray")).await;

    broker.send(Packet::PubRec(PubRecPacket::new(77))).await;
    assert_eq!(
        broker.recv().await,
        Packet::PubRel(PubRelPacket::new_with_reason(
            77,
            ReasonCode::PacketIdentifierNotFound
        ))
    );

    broker.send(Packet::PubRel(PubRelPacket::new(78))).await;
    assert_eq!(broker.recv().await, Packet::PubComp(PubCompPacket::not_found(78)));
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_publish_expires() {
    let (session, _messages, mut broker) = connected(ConnectOptions::new("flow-expiry")).await;

    let publisher = session.clone();
    let started = tokio::time::Instant::now();
    let pending = tokio::spawn(async move {
        publisher
            .publish_with_options(
                "a/b",
                b"short-lived".to_vec(),
                PublishOptions::new(QoS::AtLeastOnce).with_message_expiry_interval(5),
            )
            .await
    });

    let publish = expect_publish(broker.recv().await);
    assert_eq!(publish.message_expiry_interval(), Some(5));

    let result = pending.await.unwrap();
    assert_eq!(result, Err(MqttError::Expired { packet_id: Some(1) }));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(session.in_flight().await, 0);

    // expired messages are not retransmitted
    assert!(broker.recv_within(Duration::from_secs(30)).await.is_none());

    // the identifier is free again
    let again = session.clone();
    let next = tokio::spawn(async move { again.publish("a/b", b"n".to_vec(), QoS::AtLeastOnce).await });
    assert_eq!(expect_publish(broker.recv().await).packet_id, Some(1));
    broker.send(Packet::PubAck(PubAckPacket::new(1))).await;
    assert!(next.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_ack_timeout_is_optional() {
    let timeouts = SessionTimeouts {
        ack: Some(Duration::from_secs(2)),
        ..SessionTimeouts::default()
    };
    let (session, _messages, mut broker) =
        connected(ConnectOptions::new("flow-ack-timeout").with_timeouts(timeouts)).await;

    let publisher = session.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish("a/b", b"slow".to_vec(), QoS::AtLeastOnce)
            .await
    });
    expect_publish(broker.recv().await);

    assert_eq!(pending.await.unwrap(), Err(MqttError::Timeout));
    // the message stays in flight; only the caller stopped waiting
    assert_eq!(session.in_flight().await, 1);
    assert!(session.is_connected().await);
}

#[tokio::test]
async fn test_subscribe_reports_granted_codes() {
    let (session, _messages, mut broker) = connected(ConnectOptions::new("flow-sub")).await;

    let subscriber = session.clone();
    let pending = tokio::spawn(async move {
        subscriber
            .subscribe(&[("x/demo", QoS::ExactlyOnce), ("y/#", QoS::AtLeastOnce)])
            .await
    });

    let subscribe = match broker.recv().await {
        Packet::Subscribe(subscribe) => subscribe,
        other => panic!("expected SUBSCRIBE, got {other:?}"),
    };
    assert_eq!(subscribe.filters.len(), 2);
    assert_eq!(subscribe.filters[0].filter, "x/demo");
    assert_eq!(subscribe.filters[0].options.qos, QoS::ExactlyOnce);
    assert_eq!(subscribe.filters[1].filter, "y/#");

    broker
        .send(Packet::SubAck(SubAckPacket::new(
            subscribe.packet_id,
            vec![ReasonCode::GrantedQoS2, ReasonCode::NotAuthorized],
        )))
        .await;

    let codes = pending.await.unwrap().unwrap();
    assert_eq!(codes, vec![ReasonCode::GrantedQoS2, ReasonCode::NotAuthorized]);
    assert_eq!(u8::from(codes[0]), 2);
}

#[tokio::test]
async fn test_unsubscribe_reports_codes() {
    let (session, _messages, mut broker) = connected(ConnectOptions::new("flow-unsub")).await;

    let subscriber = session.clone();
    let pending = tokio::spawn(async move { subscriber.unsubscribe(&["x/demo"]).await });

    let packet_id = match broker.recv().await {
        Packet::Unsubscribe(unsubscribe) => {
            assert_eq!(unsubscribe.filters, vec!["x/demo".to_string()]);
            unsubscribe.packet_id
        }
        other => panic!("expected UNSUBSCRIBE, got {other:?}"),
    };
    broker
        .send(Packet::UnsubAck(UnsubAckPacket::new(
            packet_id,
            vec![ReasonCode::NoSubscriptionExisted],
        )))
        .await;

    assert_eq!(
        pending.await.unwrap().unwrap(),
        vec![ReasonCode::NoSubscriptionExisted]
    );
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_timeout_keeps_connection() {
    let (session, _messages, mut broker) = connected(ConnectOptions::new("flow-sub-slow")).await;

    let subscriber = session.clone();
    let pending = tokio::spawn(async move { subscriber.subscribe(&[("a/b", QoS::AtMostOnce)]).await });
    assert!(matches!(broker.recv().await, Packet::Subscribe(_)));

    assert_eq!(pending.await.unwrap(), Err(MqttError::Timeout));
    assert!(session.is_connected().await);
}

#[tokio::test]
async fn test_invalid_filters_and_topics_fail_locally() {
    let (session, _messages, mut broker) = connected(ConnectOptions::new("flow-local")).await;

    assert!(matches!(
        session.subscribe(&[("a/#/b", QoS::AtMostOnce)]).await,
        Err(MqttError::InvalidTopicFilter(_))
    ));
    assert!(matches!(
        session.publish("a/+", b"x".to_vec(), QoS::AtMostOnce).await,
        Err(MqttError::InvalidTopicName(_))
    ));
    assert!(matches!(
        session.subscribe(&[]).await,
        Err(MqttError::ProtocolError(_))
    ));
    assert!(broker
        .recv_within(Duration::from_millis(50))
        .await
        .is_none());
}

#[tokio::test]
async fn test_inbound_qos1_is_acked_and_delivered() {
    let (_session, mut messages, mut broker) = connected(ConnectOptions::new("flow-in-1")).await;

    broker
        .send(Packet::Publish(
            PublishPacket::new("news", &b"hello"[..]).with_qos(QoS::AtLeastOnce, 5),
        ))
        .await;
    assert_eq!(broker.recv().await, Packet::PubAck(PubAckPacket::new(5)));

    let message = messages.recv().await.unwrap();
    assert_eq!(message.topic, "news");
    assert_eq!(&message.payload[..], b"hello");
    assert_eq!(message.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_inbound_qos2_duplicate_delivered_once() {
    let (_session, mut messages, mut broker) = connected(ConnectOptions::new("flow-in-2")).await;

    let publish = PublishPacket::new("orders", &b"#1"[..]).with_qos(QoS::ExactlyOnce, 9);
    broker.send(Packet::Publish(publish.clone())).await;
    assert_eq!(broker.recv().await, Packet::PubRec(PubRecPacket::new(9)));

    broker.send(Packet::Publish(publish.with_dup(true))).await;
    assert_eq!(broker.recv().await, Packet::PubRec(PubRecPacket::new(9)));
    assert!(messages.try_recv().is_none());

    broker.send(Packet::PubRel(PubRelPacket::new(9))).await;
    assert_eq!(broker.recv().await, Packet::PubComp(PubCompPacket::new(9)));

    let message = messages.recv().await.unwrap();
    assert_eq!(message.topic, "orders");

    // a marker proves nothing else was queued before it
    broker
        .send(Packet::Publish(PublishPacket::new("marker", &b""[..])))
        .await;
    assert_eq!(messages.recv().await.unwrap().topic, "marker");
}

#[tokio::test(start_paused = true)]
async fn test_receive_maximum_limits_in_flight() {
    let connack = ConnAckPacket::new(false, ReasonCode::Success).with_receive_maximum(1);
    let (session, _messages, mut broker) =
        connected_with(ConnectOptions::new("flow-quota"), connack).await;

    let first = session.clone();
    let first = tokio::spawn(async move { first.publish("q", b"1".to_vec(), QoS::AtLeastOnce).await });
    let id = expect_publish(broker.recv().await).packet_id.unwrap();

    let second = session.clone();
    let second = tokio::spawn(async move { second.publish("q", b"2".to_vec(), QoS::AtLeastOnce).await });
    assert!(broker.recv_within(Duration::from_secs(1)).await.is_none());
    assert_eq!(session.in_flight().await, 1);

    broker.send(Packet::PubAck(PubAckPacket::new(id))).await;
    let next = expect_publish(broker.recv().await);
    assert_eq!(&next.payload[..], b"2");
    broker
        .send(Packet::PubAck(PubAckPacket::new(next.packet_id.unwrap())))
        .await;

    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_queued_publishes_fail_when_connection_drops() {
    let connack = ConnAckPacket::new(false, ReasonCode::Success).with_receive_maximum(1);
    let (session, _messages, mut broker) =
        connected_with(ConnectOptions::new("flow-queued-lost"), connack).await;

    let first = session.clone();
    let first = tokio::spawn(async move { first.publish("q", b"1".to_vec(), QoS::AtLeastOnce).await });
    expect_publish(broker.recv().await);

    let second = session.clone();
    let second = tokio::spawn(async move { second.publish("q", b"2".to_vec(), QoS::AtLeastOnce).await });
    assert!(broker.recv_within(Duration::from_secs(1)).await.is_none());

    drop(broker);
    assert_eq!(first.await.unwrap(), Err(MqttError::ConnectionLost));
    assert_eq!(second.await.unwrap(), Err(MqttError::ConnectionLost));
}

#[tokio::test(start_paused = true)]
async fn test_expiry_counts_time_spent_waiting_for_a_slot() {
    let connack = ConnAckPacket::new(false, ReasonCode::Success).with_receive_maximum(1);
    let (session, _messages, mut broker) =
        connected_with(ConnectOptions::new("flow-queued-expiry"), connack).await;

    let first = session.clone();
    let first = tokio::spawn(async move { first.publish("q", b"1".to_vec(), QoS::AtLeastOnce).await });
    let id = expect_publish(broker.recv().await).packet_id.unwrap();

    let stale = session.clone();
    let stale = tokio::spawn(async move {
        stale
            .publish_with_options(
                "q",
                b"stale".to_vec(),
                PublishOptions::new(QoS::AtLeastOnce).with_message_expiry_interval(5),
            )
            .await
    });
    assert!(broker.recv_within(Duration::from_secs(10)).await.is_none());

    broker.send(Packet::PubAck(PubAckPacket::new(id))).await;
    assert!(first.await.unwrap().is_ok());
    assert_eq!(stale.await.unwrap(), Err(MqttError::Expired { packet_id: None }));
    assert_eq!(session.in_flight().await, 0);
    assert!(broker.recv_within(Duration::from_secs(1)).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_queued_publish_carries_remaining_expiry() {
    let connack = ConnAckPacket::new(false, ReasonCode::Success).with_receive_maximum(1);
    let (session, _messages, mut broker) =
        connected_with(ConnectOptions::new("flow-queued-remaining"), connack).await;

    let first = session.clone();
    let first = tokio::spawn(async move { first.publish("q", b"1".to_vec(), QoS::AtLeastOnce).await });
    let id = expect_publish(broker.recv().await).packet_id.unwrap();

    let queued = session.clone();
    let queued = tokio::spawn(async move {
        queued
            .publish_with_options(
                "q",
                b"later".to_vec(),
                PublishOptions::new(QoS::AtLeastOnce).with_message_expiry_interval(30),
            )
            .await
    });
    assert!(broker.recv_within(Duration::from_secs(10)).await.is_none());

    broker.send(Packet::PubAck(PubAckPacket::new(id))).await;
    let publish = expect_publish(broker.recv().await);
    assert_eq!(&publish.payload[..], b"later");
    assert_eq!(publish.message_expiry_interval(), Some(20));
    broker
        .send(Packet::PubAck(PubAckPacket::new(publish.packet_id.unwrap())))
        .await;

    assert!(first.await.unwrap().is_ok());
    assert!(queued.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_qos2_past_pubrec_outlives_its_expiry() {
    let (session, _messages, mut broker) = connected(ConnectOptions::new("flow-qos2-expiry")).await;

    let publisher = session.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish_with_options(
                "jobs",
                b"once".to_vec(),
                PublishOptions::new(QoS::ExactlyOnce).with_message_expiry_interval(5),
            )
            .await
    });
    let id = expect_publish(broker.recv().await).packet_id.unwrap();
    broker.send(Packet::PubRec(PubRecPacket::new(id))).await;
    assert_eq!(broker.recv().await, Packet::PubRel(PubRelPacket::new(id)));

    assert!(broker.recv_within(Duration::from_secs(10)).await.is_none());
    assert_eq!(session.in_flight().await, 1);

    broker.send(Packet::PubComp(PubCompPacket::new(id))).await;
    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome.packet_id, Some(id));
    assert_eq!(outcome.reason_code, ReasonCode::Success);
    assert_eq!(session.in_flight().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_keeps_message_already_acknowledged() {
    let (session, mut messages, mut broker) =
        connected(ConnectOptions::new("flow-backpressure")).await;

    let sent = MESSAGE_CHANNEL_CAPACITY + 10;
    for id in 1..=sent {
        let id = u16::try_from(id).unwrap();
        broker
            .send(Packet::Publish(
                PublishPacket::new("burst", id.to_be_bytes().to_vec()).with_qos(QoS::AtLeastOnce, id),
            ))
            .await;
    }

    // the reader acknowledges one message past what the stream holds, then waits
    let mut acknowledged = 0;
    while let Some(packet) = broker.recv_within(Duration::from_secs(1)).await {
        assert!(matches!(packet, Packet::PubAck(_)));
        acknowledged += 1;
    }
    assert_eq!(acknowledged, MESSAGE_CHANNEL_CAPACITY + 1);

    session.disconnect(None).await.unwrap();
    assert!(matches!(broker.recv().await, Packet::Disconnect(_)));

    let mut delivered = Vec::new();
    while let Ok(Some(message)) =
        tokio::time::timeout(Duration::from_secs(1), messages.recv()).await
    {
        delivered.push(u16::from_be_bytes([message.payload[0], message.payload[1]]));
    }
    assert_eq!(delivered.len(), acknowledged);
    assert!(delivered.iter().copied().eq(1..=u16::try_from(acknowledged).unwrap()));
}

#[tokio::test]
async fn test_broker_maximum_packet_size_is_enforced() {
    let connack = ConnAckPacket::new(false, ReasonCode::Success).with_maximum_packet_size(64);
    let (session, _messages, mut broker) =
        connected_with(ConnectOptions::new("flow-small"), connack).await;

    let result = session
        .publish("big", vec![0u8; 100], QoS::AtLeastOnce)
        .await;
    assert!(matches!(result, Err(MqttError::PacketTooLarge { max: 64, .. })));
    assert_eq!(session.in_flight().await, 0);
    assert!(session.is_connected().await);

    session
        .publish("small", b"ok".to_vec(), QoS::AtMostOnce)
        .await
        .unwrap();
    assert_eq!(expect_publish(broker.recv().await).topic_name, "small");
}

#[tokio::test]
async fn test_oversized_inbound_packet_closes_connection() {
    let (session, _messages, mut broker) =
        connected(ConnectOptions::new("flow-limit").with_maximum_packet_size(32)).await;

    broker
        .send(Packet::Publish(PublishPacket::new("t", vec![1u8; 64])))
        .await;
    match broker.recv().await {
        Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code, ReasonCode::PacketTooLarge);
        }
        other => panic!("expected DISCONNECT, got {other:?}"),
    }
    assert!(broker.try_recv().await.is_err());
    assert!(!session.is_connected().await);
}

use super::message::{ClientMessage, ServerMessage};
use super::protocol::{Connection, ConnectionState, ProtocolError};
use crate::broker::{Broker, Message};
use crate::config::BrokerSettings;
use crate::persistence::Persistence;
use crate::utils::BrokerError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver};

fn test_broker() -> Arc<Broker> {
    let persistence = Persistence::temporary().unwrap();
    Arc::new(Broker::new_with_persistence(
        BrokerSettings {
            max_ready_count: 100,
            ..BrokerSettings::default()
        },
        persistence,
    ))
}

fn connect(broker: &Arc<Broker>) -> (Connection, UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Connection::new(broker.clone(), tx), rx)
}

fn identify(conn: &mut Connection) {
    let reply = conn
        .handle(ClientMessage::Identify {
            version: 1,
            client_name: Some("test".into()),
        })
        .unwrap();
    assert!(matches!(reply, Some(ServerMessage::Identified { version: 1, .. })));
}

fn subscribed(broker: &Arc<Broker>, ready: u64) -> (Connection, UnboundedReceiver<Message>) {
    let (mut conn, rx) = connect(broker);
    identify(&mut conn);
    let reply = conn
        .handle(ClientMessage::Subscribe {
            topic: "T".into(),
            channel: "c".into(),
        })
        .unwrap();
    assert_eq!(reply, Some(ServerMessage::Ok));
    if ready > 0 {
        conn.handle(ClientMessage::Ready { count: ready }).unwrap();
    }
    (conn, rx)
}

fn publish(conn: &mut Connection, body: &str) {
    let reply = conn
        .handle(ClientMessage::Publish {
            topic: "T".into(),
            payload: body.as_bytes().to_vec(),
        })
        .unwrap();
    assert!(matches!(reply, Some(ServerMessage::Published { .. })));
}

#[test]
fn test_commands_before_identify_are_fatal() {
    let broker = test_broker();
    let (mut conn, _rx) = connect(&broker);

    let err = conn
        .handle(ClientMessage::Publish {
            topic: "T".into(),
            payload: b"x".to_vec(),
        })
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Invalid(_)));
    assert!(err.is_fatal());
    assert_eq!(err.code(), "E_INVALID");
    assert_eq!(conn.state(), ConnectionState::Connected);

    // Heartbeat replies are accepted in any state.
    assert_eq!(conn.handle(ClientMessage::Nop).unwrap(), None);
}

#[test]
fn test_identify_rejects_unknown_version() {
    let broker = test_broker();
    let (mut conn, _rx) = connect(&broker);
    let err = conn
        .handle(ClientMessage::Identify {
            version: 7,
            client_name: None,
        })
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnsupportedVersion(7)));
    assert_eq!(err.code(), "E_BAD_PROTOCOL");
}

#[test]
fn test_identify_twice_is_invalid() {
    let broker = test_broker();
    let (mut conn, _rx) = connect(&broker);
    identify(&mut conn);
    assert!(
        conn.handle(ClientMessage::Identify {
            version: 1,
            client_name: None,
        })
        .is_err()
    );
}

#[test]
fn test_identified_reply_carries_limits() {
    let broker = test_broker();
    let (mut conn, _rx) = connect(&broker);
    let reply = conn
        .handle(ClientMessage::Identify {
            version: 1,
            client_name: None,
        })
        .unwrap();
    let settings = broker.settings();
    assert_eq!(
        reply,
        Some(ServerMessage::Identified {
            version: 1,
            max_ready_count: 100,
            msg_timeout_ms: settings.msg_timeout_ms,
            heartbeat_interval_ms: settings.heartbeat_interval_ms,
        })
    );
    assert_eq!(conn.state(), ConnectionState::Identified);
}

#[test]
fn test_subscribe_ready_deliver_finish() {
    let broker = test_broker();
    let (mut consumer, mut rx) = subscribed(&broker, 1);
    assert_eq!(consumer.state(), ConnectionState::Delivering);

    let (mut producer, _prx) = connect(&broker);
    identify(&mut producer);
    publish(&mut producer, "hello");

    let msg = rx.try_recv().unwrap();
    assert_eq!(&msg.body[..], b"hello");
    assert_eq!(msg.attempts, 1);

    consumer
        .handle(ClientMessage::Finish { message_id: msg.id })
        .unwrap();
    let channel = consumer.subscription().unwrap().clone();
    assert_eq!(channel.in_flight_count(), 0);

    // A second finish is reported but does not end the connection.
    let err = consumer
        .handle(ClientMessage::Finish { message_id: msg.id })
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Broker(BrokerError::NotInFlight(_))));
    assert!(!err.is_fatal());
    assert_eq!(err.code(), "E_NOT_IN_FLIGHT");
}

#[test]
fn test_subscribe_twice_is_invalid() {
    let broker = test_broker();
    let (mut conn, _rx) = subscribed(&broker, 0);
    let err = conn
        .handle(ClientMessage::Subscribe {
            topic: "T".into(),
            channel: "other".into(),
        })
        .unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn test_ready_before_subscribe_is_invalid() {
    let broker = test_broker();
    let (mut conn, _rx) = connect(&broker);
    identify(&mut conn);
    let err = conn.handle(ClientMessage::Ready { count: 1 }).unwrap_err();
    assert!(matches!(err, ProtocolError::Invalid(_)));
}

#[test]
fn test_ready_above_maximum_is_rejected() {
    let broker = test_broker();
    let (mut conn, _rx) = subscribed(&broker, 0);
    let err = conn.handle(ClientMessage::Ready { count: 101 }).unwrap_err();
    assert!(matches!(err, ProtocolError::Invalid(_)));
    assert_eq!(conn.state(), ConnectionState::Subscribed);
}

#[test]
fn test_ready_zero_returns_to_subscribed() {
    let broker = test_broker();
    let (mut conn, _rx) = subscribed(&broker, 5);
    assert_eq!(conn.state(), ConnectionState::Delivering);
    conn.handle(ClientMessage::Ready { count: 0 }).unwrap();
    assert_eq!(conn.state(), ConnectionState::Subscribed);
}

#[test]
fn test_requeue_and_touch_through_connection() {
    let broker = test_broker();
    let (mut consumer, mut rx) = subscribed(&broker, 1);
    publish(&mut consumer, "retry-me");
    let first = rx.try_recv().unwrap();

    consumer
        .handle(ClientMessage::Touch {
            message_id: first.id,
        })
        .unwrap();
    consumer
        .handle(ClientMessage::Requeue {
            message_id: first.id,
            delay_ms: 0,
        })
        .unwrap();
    assert!(rx.try_recv().is_err());

    consumer.handle(ClientMessage::Ready { count: 1 }).unwrap();
    let again = rx.try_recv().unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.attempts, 2);
}

#[test]
fn test_dropping_connection_requeues_in_flight() {
    let broker = test_broker();
    let (consumer, mut rx) = subscribed(&broker, 2);
    let channel = consumer.subscription().unwrap().clone();

    broker.publish("T", b"a".to_vec()).unwrap();
    broker.publish("T", b"b".to_vec()).unwrap();
    assert_eq!(rx.try_recv().unwrap().attempts, 1);
    assert_eq!(channel.in_flight_count(), 2);

    drop(consumer);
    assert_eq!(channel.in_flight_count(), 0);
    assert_eq!(channel.client_count(), 0);
    assert_eq!(channel.depth(), 2);

    let (_next, mut rx2) = subscribed(&broker, 2);
    let redelivered: Vec<_> = std::iter::from_fn(|| rx2.try_recv().ok()).collect();
    assert_eq!(redelivered.len(), 2);
    assert_eq!(&redelivered[0].body[..], b"a");
    assert!(redelivered.iter().all(|m| m.attempts == 2));
}

#[test]
fn test_close_command_stops_delivery() {
    let broker = test_broker();
    let (mut conn, mut rx) = subscribed(&broker, 10);

    let reply = conn.handle(ClientMessage::Close).unwrap();
    assert_eq!(reply, Some(ServerMessage::CloseWait));
    assert_eq!(conn.state(), ConnectionState::Closing);

    broker.publish("T", b"late".to_vec()).unwrap();
    assert!(rx.try_recv().is_err());

    assert!(conn.handle(ClientMessage::Ready { count: 1 }).is_err());
    assert!(
        conn.handle(ClientMessage::Publish {
            topic: "T".into(),
            payload: b"x".to_vec(),
        })
        .is_err()
    );

    assert_eq!(conn.close(), 0);
    // Closing again is a no-op.
    assert_eq!(conn.close(), 0);
}

#[test]
fn test_bad_names_are_fatal() {
    let broker = test_broker();
    let (mut conn, _rx) = connect(&broker);
    identify(&mut conn);
    let err = conn
        .handle(ClientMessage::Subscribe {
            topic: "no spaces".into(),
            channel: "c".into(),
        })
        .unwrap_err();
    assert_eq!(err.code(), "E_BAD_NAME");
    assert!(err.is_fatal());
}

#[test]
fn test_idle_detection() {
    let broker = test_broker();
    let (conn, _rx) = connect(&broker);
    let limit = Duration::from_millis(100);
    assert!(!conn.is_idle(Instant::now(), limit));
    assert!(conn.is_idle(Instant::now() + Duration::from_millis(150), limit));
}

#[test]
fn test_wire_format() {
    let cmd: ClientMessage =
        serde_json::from_str(r#"{"type":"requeue","message_id":"00112233445566778899aabbccddeeff"}"#)
            .unwrap();
    match cmd {
        ClientMessage::Requeue {
            message_id,
            delay_ms,
        } => {
            assert_eq!(message_id.to_string(), "00112233445566778899aabbccddeeff");
            assert_eq!(delay_ms, 0);
        }
        other => panic!("unexpected command {other:?}"),
    }

    let json = serde_json::to_value(ServerMessage::Heartbeat).unwrap();
    assert_eq!(json, serde_json::json!({"type": "heartbeat"}));

    assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"teleport"}"#).is_err());
}

#[test]
fn test_publish_payload_is_base64() {
    let cmd: ClientMessage =
        serde_json::from_str(r#"{"type":"publish","topic":"T","payload":"/wD+"}"#).unwrap();
    match cmd {
        ClientMessage::Publish { topic, payload } => {
            assert_eq!(topic, "T");
            assert_eq!(payload, vec![0xff, 0x00, 0xfe]);
        }
        other => panic!("unexpected command {other:?}"),
    }

    assert!(
        serde_json::from_str::<ClientMessage>(r#"{"type":"publish","topic":"T","payload":"***"}"#)
            .is_err()
    );
}

#[test]
fn test_binary_body_survives_delivery() {
    let broker = test_broker();
    let (_consumer, mut rx) = subscribed(&broker, 1);
    let body = vec![0xff, 0x00, 0xfe, b'\n', 0x80];
    broker.publish("T", body.clone()).unwrap();

    let frame = ServerMessage::from(&rx.try_recv().unwrap());
    let text = serde_json::to_string(&frame).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["payload"], "/wD+CoA=");

    match serde_json::from_str::<ServerMessage>(&text).unwrap() {
        ServerMessage::Message { payload, .. } => assert_eq!(payload, body),
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn test_regranting_ready_keeps_in_flight_within_credit() {
    let broker = test_broker();
    let (mut consumer, mut rx) = subscribed(&broker, 2);
    for i in 0..6 {
        broker.publish("T", format!("{i}").into_bytes()).unwrap();
    }
    let first: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert_eq!(first.len(), 2);

    // Same grant again while both are still unacknowledged.
    consumer.handle(ClientMessage::Ready { count: 2 }).unwrap();
    assert!(rx.try_recv().is_err());
    let channel = consumer.subscription().unwrap().clone();
    assert_eq!(channel.in_flight_count(), 2);

    consumer
        .handle(ClientMessage::Finish {
            message_id: first[0].id,
        })
        .unwrap();
    consumer.handle(ClientMessage::Ready { count: 2 }).unwrap();
    let second: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert_eq!(second.len(), 1);
    assert_eq!(channel.in_flight_count(), 2);
}

#[test]
fn test_close_after_channel_deleted_still_answers() {
    let broker = test_broker();
    let (mut conn, _rx) = subscribed(&broker, 3);
    broker.delete_channel("T", "c").unwrap();

    let reply = conn.handle(ClientMessage::Close).unwrap();
    assert_eq!(reply, Some(ServerMessage::CloseWait));
    assert_eq!(conn.state(), ConnectionState::Closing);
}

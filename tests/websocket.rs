//! End-to-end tests over real sockets

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chat_hub::{
    ChannelId, Hub, HubConfig, HubHandle, PresenceStatus, Server, ServerMessage, UserId,
    CHANNELS_HEADER, USER_ID_HEADER,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(config: HubConfig) -> (SocketAddr, HubHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (hub, _join) = Hub::spawn(config.clone()).unwrap();
    tokio::spawn(Server::new(hub.clone(), config).run(listener));
    (addr, hub)
}

async fn dial(addr: SocketAddr, user: Option<&str>, channels: &str) -> Result<Ws, tungstenite::Error> {
    let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
    if let Some(user) = user {
        request
            .headers_mut()
            .insert(USER_ID_HEADER, user.parse().unwrap());
    }
    if !channels.is_empty() {
        request
            .headers_mut()
            .insert(CHANNELS_HEADER, channels.parse().unwrap());
    }
    connect_async(request).await.map(|(ws, _)| ws)
}

/// Next JSON envelope, skipping control frames
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read envelopes until one of the given type shows up
async fn expect_type(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let value = next_json(ws).await;
        if value["type"] == kind {
            return value;
        }
    }
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn wait_for_connections(hub: &HubHandle, user: i64, expected: usize) {
    for _ in 0..400 {
        if hub.user_connection_count(UserId(user)).await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("user {} never reached {} connections", user, expected);
}

#[tokio::test]
async fn test_channel_message_reaches_all_members_including_sender() {
    let (addr, hub) = start(HubConfig::default()).await;

    let mut a = dial(addr, Some("1"), "").await.unwrap();
    let mut b = dial(addr, Some("2"), "").await.unwrap();
    expect_type(&mut a, "bulk_presence").await;
    expect_type(&mut b, "bulk_presence").await;

    send(&mut a, json!({"type": "channel_subscribe", "data": {"channelId": 7}})).await;
    send(&mut b, json!({"type": "channel_subscribe", "data": {"channelId": 7}})).await;
    let ack = expect_type(&mut a, "ack").await;
    assert_eq!(ack["data"]["type"], "channel_subscribe");
    assert_eq!(ack["data"]["data"]["channelId"], 7);
    expect_type(&mut b, "ack").await;

    send(&mut a, json!({"type": "message", "data": {"content": "hi", "channelId": 7}})).await;

    for ws in [&mut a, &mut b] {
        let msg = expect_type(ws, "message").await;
        assert_eq!(msg["channelId"], 7);
        assert_eq!(msg["data"]["content"], "hi");
        assert_eq!(msg["data"]["senderId"], 1);
    }

    assert_eq!(hub.channel_members(ChannelId(7)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_header_channels_are_joined_on_connect() {
    let (addr, _hub) = start(HubConfig::default()).await;

    let mut a = dial(addr, Some("1"), "4,5").await.unwrap();
    let mut b = dial(addr, Some("2"), "5").await.unwrap();
    expect_type(&mut a, "bulk_presence").await;
    expect_type(&mut b, "bulk_presence").await;

    send(&mut b, json!({"type": "typing", "data": {"channelId": 5, "isTyping": true}})).await;

    let typing = expect_type(&mut a, "typing").await;
    assert_eq!(typing["userId"], 2);
    assert_eq!(typing["channelId"], 5);
    assert_eq!(typing["isTyping"], true);
}

#[tokio::test]
async fn test_bad_frame_gets_error_and_connection_survives() {
    let (addr, _hub) = start(HubConfig::default()).await;

    let mut a = dial(addr, Some("1"), "").await.unwrap();
    expect_type(&mut a, "bulk_presence").await;

    a.send(Message::Text("{not json".to_string())).await.unwrap();
    let err = expect_type(&mut a, "error").await;
    assert_eq!(err["code"], "invalid_message");

    send(&mut a, json!({"type": "teleport", "data": {}})).await;
    let err = expect_type(&mut a, "error").await;
    assert_eq!(err["code"], "unknown_command");

    send(&mut a, json!({"type": "channel_subscribe", "data": {"channelId": 1}})).await;
    expect_type(&mut a, "ack").await;
}

#[tokio::test]
async fn test_missing_user_is_rejected_before_upgrade() {
    let (addr, _hub) = start(HubConfig::default()).await;

    match dial(addr, None, "").await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_origin_limit_returns_too_many_requests() {
    let config = HubConfig {
        max_connections_per_origin: 1,
        ..HubConfig::default()
    };
    let (addr, hub) = start(config).await;

    let _first = dial(addr, Some("1"), "").await.unwrap();
    wait_for_connections(&hub, 1, 1).await;

    match dial(addr, Some("2"), "").await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 429),
        other => panic!("expected 429, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_presence_goes_offline_after_last_device() {
    let (addr, hub) = start(HubConfig::default()).await;

    let mut observer = dial(addr, Some("9"), "").await.unwrap();
    expect_type(&mut observer, "bulk_presence").await;

    let mut c1 = dial(addr, Some("5"), "").await.unwrap();
    let mut c2 = dial(addr, Some("5"), "").await.unwrap();
    wait_for_connections(&hub, 5, 2).await;

    c1.close(None).await.unwrap();
    wait_for_connections(&hub, 5, 1).await;
    let record = hub.presence(UserId(5)).await.unwrap().unwrap();
    assert_eq!(record.status, PresenceStatus::Online);

    c2.close(None).await.unwrap();
    wait_for_connections(&hub, 5, 0).await;
    let record = hub.presence(UserId(5)).await.unwrap().unwrap();
    assert_eq!(record.status, PresenceStatus::Offline);

    loop {
        let presence = expect_type(&mut observer, "presence").await;
        if presence["userId"] == 5 && presence["status"] == "offline" {
            break;
        }
    }
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let config = HubConfig::default();
    let limit = config.max_frame_size;
    let (addr, hub) = start(config).await;

    let mut a = dial(addr, Some("1"), "").await.unwrap();
    expect_type(&mut a, "bulk_presence").await;

    let body = "x".repeat(limit + 1024);
    let _ = a.send(Message::Text(body)).await;

    wait_for_connections(&hub, 1, 0).await;
    let record = hub.presence(UserId(1)).await.unwrap().unwrap();
    assert_eq!(record.status, PresenceStatus::Offline);
}

#[tokio::test]
async fn test_silent_peer_hits_read_deadline() {
    let config = HubConfig {
        heartbeat_interval_secs: 1,
        read_deadline_secs: 2,
        ..HubConfig::default()
    };
    let (addr, hub) = start(config).await;

    // Never polled, so the heartbeat pings go unanswered
    let _silent = dial(addr, Some("1"), "").await.unwrap();
    wait_for_connections(&hub, 1, 1).await;

    wait_for_connections(&hub, 1, 0).await;
}

#[tokio::test]
async fn test_peer_that_stops_reading_is_disconnected() {
    let config = HubConfig {
        write_wait_secs: 1,
        ..HubConfig::default()
    };
    let (addr, hub) = start(config).await;

    let _stalled = dial(addr, Some("1"), "").await.unwrap();
    wait_for_connections(&hub, 1, 1).await;

    // Far more than the socket buffers hold
    let body = "y".repeat(128 * 1024);
    for _ in 0..200 {
        let msg = ServerMessage::chat(ChannelId(1), UserId(2), body.clone(), None);
        hub.broadcast_to_user(UserId(1), msg).await.unwrap();
    }

    wait_for_connections(&hub, 1, 0).await;
    assert_eq!(hub.stats().await.unwrap().clients, 0);
}

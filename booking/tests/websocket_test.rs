//! Channel transport tests over a real socket.
//!
//! Binds the router on an ephemeral port and talks to `/ws` with
//! `tokio-tungstenite`, the way a browser client would.
//!
//! Run with: `cargo test --test websocket_test`

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use slotbook::server::{AppState, build_router};
use slotbook::{BookingApp, Config, PatientId};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MONDAY: &str = "2025-01-06";

async fn spawn_server(config: Config) -> SocketAddr {
    let app = BookingApp::new(config);
    let router = build_router(AppState::new(&app));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    addr
}

async fn register_provider(addr: SocketAddr) -> String {
    let body: Value = reqwest::Client::new()
        .post(format!("http://{addr}/api/providers"))
        .json(&json!({
            "name": "Dr. X",
            "fees": { "online": 50_000, "in_person": 80_000 },
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["id"].as_str().unwrap().to_string()
}

async fn connect(addr: SocketAddr, patient_id: Option<PatientId>) -> Socket {
    let url = match patient_id {
        Some(patient_id) => format!("ws://{addr}/ws?patient_id={patient_id}"),
        None => format!("ws://{addr}/ws"),
    };
    let (mut socket, _) = connect_async(url).await.unwrap();

    let hello = recv(&mut socket).await;
    assert_eq!(hello["type"], "connected");
    socket
}

async fn send(socket: &mut Socket, message: Value) {
    socket.send(Message::Text(message.to_string())).await.unwrap();
}

/// Next JSON message, skipping control frames.
async fn recv(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read until a message of `kind` arrives.
async fn recv_type(socket: &mut Socket, kind: &str) -> Value {
    loop {
        let message = recv(socket).await;
        if message["type"] == kind {
            return message;
        }
    }
}

fn lock_slot(request_id: &str, provider_id: &str, time: &str) -> Value {
    json!({
        "type": "lock_slot",
        "request_id": request_id,
        "provider_id": provider_id,
        "date": MONDAY,
        "time": time,
    })
}

/// Test 1: Lock Over The Channel
///
/// A watcher in the provider room sees the lock; a second patient is refused.
#[tokio::test]
async fn test_lock_request_and_room_events() {
    let addr = spawn_server(Config::default()).await;
    let provider_id = register_provider(addr).await;

    let mut watcher = connect(addr, None).await;
    send(
        &mut watcher,
        json!({ "type": "subscribe", "rooms": [format!("provider:{provider_id}")] }),
    )
    .await;
    let subscribed = recv(&mut watcher).await;
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["rooms"][0], format!("provider:{provider_id}"));

    let mut alice = connect(addr, Some(PatientId::new())).await;
    send(&mut alice, lock_slot("a1", &provider_id, "10:00")).await;
    let result = recv_type(&mut alice, "lock_result").await;
    assert_eq!(result["request_id"], "a1");
    assert_eq!(result["granted"], true);
    assert!(result["expires_at"].is_string());

    let event = recv_type(&mut watcher, "event").await;
    assert_eq!(event["room"], format!("provider:{provider_id}"));
    assert_eq!(event["event"]["event"], "slot:locked");
    assert_eq!(event["event"]["time"], "10:00");

    let mut bob = connect(addr, Some(PatientId::new())).await;
    send(&mut bob, lock_slot("b1", &provider_id, "10:00")).await;
    let refused = recv_type(&mut bob, "lock_result").await;
    assert_eq!(refused["granted"], false);
    assert_eq!(refused["reason"], "lock_conflict");
    assert!(refused.get("expires_at").is_none());
}

/// Test 2: Unlock Announces
#[tokio::test]
async fn test_unlock_publishes_slot_unlocked() {
    let addr = spawn_server(Config::default()).await;
    let provider_id = register_provider(addr).await;
    let mut alice = connect(addr, Some(PatientId::new())).await;

    send(
        &mut alice,
        json!({ "type": "subscribe", "rooms": [format!("provider:{provider_id}")] }),
    )
    .await;
    recv_type(&mut alice, "subscribed").await;

    send(&mut alice, lock_slot("a1", &provider_id, "11:00")).await;
    recv_type(&mut alice, "lock_result").await;

    send(
        &mut alice,
        json!({
            "type": "unlock_slot",
            "request_id": "a2",
            "provider_id": provider_id,
            "date": MONDAY,
            "time": "11:00",
        }),
    )
    .await;
    let unlocked = recv_type(&mut alice, "unlock_result").await;
    assert_eq!(unlocked["released"], true);

    loop {
        let event = recv_type(&mut alice, "event").await;
        if event["event"]["event"] == "slot:unlocked" {
            break;
        }
    }
}

/// Test 3: Protocol Errors
///
/// Unknown rooms and malformed frames get an `error`; the connection stays
/// usable.
#[tokio::test]
async fn test_protocol_errors_keep_connection_open() {
    let addr = spawn_server(Config::default()).await;
    let mut socket = connect(addr, None).await;

    send(&mut socket, json!({ "type": "subscribe", "rooms": ["lobby"] })).await;
    assert_eq!(recv(&mut socket).await["type"], "error");
    assert_eq!(recv(&mut socket).await["type"], "subscribed");

    socket.send(Message::Text("not json".to_string())).await.unwrap();
    assert_eq!(recv(&mut socket).await["type"], "error");

    send(&mut socket, json!({ "type": "ping" })).await;
    assert_eq!(recv(&mut socket).await["type"], "pong");
}

/// Test 4: Connection Limit
#[tokio::test]
async fn test_connection_limit() {
    let mut config = Config::default();
    config.websocket.max_connections = 1;
    let addr = spawn_server(config).await;

    let _first = connect(addr, None).await;
    let second = connect_async(format!("ws://{addr}/ws")).await;

    assert!(second.is_err());
}

/// Test 5: Disconnect Keeps Locks
///
/// Dropping the socket leaves rooms but the lock stays until it expires.
#[tokio::test]
async fn test_disconnect_does_not_release_lock() {
    let addr = spawn_server(Config::default()).await;
    let provider_id = register_provider(addr).await;

    let mut alice = connect(addr, Some(PatientId::new())).await;
    send(&mut alice, lock_slot("a1", &provider_id, "13:00")).await;
    recv_type(&mut alice, "lock_result").await;
    alice.close(None).await.unwrap();
    drop(alice);

    let status: Value = reqwest::get(format!(
        "http://{addr}/api/slots/status?provider_id={provider_id}&date={MONDAY}&time=13:00"
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(status["locked"], true);
}

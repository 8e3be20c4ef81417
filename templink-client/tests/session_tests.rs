//! The websocket client against an in-process backend speaking the
//! render_template protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use templink_cache::{Connection, ConnectionEvent, Registry, TemplateCache};
use templink_client::config::ReconnectConfig;
use templink_client::error::WsError;
use templink_client::realtime::{connect, spawn_session_manager, SessionSettings};
use templink_client::ws::WsConnection;
use templink_core::{TemplateValue, Variables};
use templink_test_utils::fixtures::test_context;
use templink_test_utils::Recorder;

const TOKEN: &str = "secret";

type ServerSocket = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn send_json(socket: &mut ServerSocket, value: Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv_json(socket: &mut ServerSocket) -> Value {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("client went away: {other:?}"),
        }
    }
}

/// Accept one client and run the auth handshake.
async fn accept(listener: &TcpListener, accept_token: bool) -> ServerSocket {
    let (tcp, _) = listener.accept().await.unwrap();
    let mut socket = tokio_tungstenite::accept_async(tcp).await.unwrap();
    send_json(&mut socket, json!({"type": "auth_required", "ha_version": "2024.6.0"})).await;

    let auth = recv_json(&mut socket).await;
    assert_eq!(auth["type"], "auth");
    if accept_token && auth["access_token"] == TOKEN {
        send_json(&mut socket, json!({"type": "auth_ok", "ha_version": "2024.6.0"})).await;
    } else {
        send_json(&mut socket, json!({"type": "auth_invalid", "message": "Invalid access token"}))
            .await;
    }
    socket
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn settings(addr: SocketAddr) -> SessionSettings {
    SessionSettings {
        endpoint: format!("ws://{addr}"),
        access_token: TOKEN.to_string(),
        reconnect: ReconnectConfig {
            initial_ms: 10,
            max_ms: 50,
            multiplier: 2.0,
            jitter_ms: 0,
        },
    }
}

#[tokio::test]
async fn test_handshake_rejects_bad_token() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let _socket = accept(&listener, false).await;
    });

    let result = connect(&format!("ws://{addr}"), "wrong").await;

    assert!(matches!(result, Err(WsError::AuthRejected(_))));
    server.await.unwrap();
}

#[tokio::test]
async fn test_subscribe_push_and_unsubscribe_over_websocket() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut socket = accept(&listener, true).await;

        let subscribe = recv_json(&mut socket).await;
        assert_eq!(subscribe["type"], "render_template");
        assert_eq!(subscribe["template"], "{{ states('light.x') }}");
        assert_eq!(subscribe["variables"]["user"], "alice");
        let id = subscribe["id"].as_u64().unwrap();

        send_json(&mut socket, json!({"id": id, "type": "result", "success": true, "result": null}))
            .await;
        send_json(
            &mut socket,
            json!({"id": id, "type": "event", "event": {"result": "on", "listeners": {"all": false}}}),
        )
        .await;

        let unsubscribe = recv_json(&mut socket).await;
        assert_eq!(unsubscribe["type"], "unsubscribe_events");
        assert_eq!(unsubscribe["subscription"], id);
        let unsubscribe_id = unsubscribe["id"].as_u64().unwrap();
        send_json(
            &mut socket,
            json!({"id": unsubscribe_id, "type": "result", "success": true, "result": null}),
        )
        .await;
    });

    let connection = Arc::new(WsConnection::new());
    let cache = TemplateCache::new(
        Arc::clone(&connection) as Arc<dyn Connection>,
        Registry::shared(),
        test_context(),
    );
    let (push_tx, push_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(16);
    tokio::spawn(cache.dispatcher().run(push_rx));
    let manager = spawn_session_manager(Arc::clone(&connection), settings(addr), push_tx, event_tx);

    let event = event_rx.recv().await.unwrap();
    assert_eq!(event, ConnectionEvent::Connected);
    cache.handle_event(event).await;

    let recorder = Recorder::new();
    let sub = cache
        .subscribe("{{ states('light.x') }}", Variables::new(), recorder.callback())
        .await;
    assert!(cache.entry(sub.key()).unwrap().live);

    eventually(|| recorder.last() == Some(TemplateValue::rendered("on"))).await;
    assert_eq!(recorder.values()[0], TemplateValue::Pending);

    sub.unsubscribe().await;
    assert!(cache.snapshot().is_empty());
    assert_eq!(cache.stats().backend_unsubscribes, 1);

    server.await.unwrap();
    manager.abort();
}

#[tokio::test]
async fn test_rejected_template_arrives_as_failure() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut socket = accept(&listener, true).await;
        let subscribe = recv_json(&mut socket).await;
        let id = subscribe["id"].as_u64().unwrap();
        send_json(
            &mut socket,
            json!({
                "id": id,
                "type": "result",
                "success": false,
                "error": {"code": "template_error", "message": "unexpected '}'"}
            }),
        )
        .await;
        // Keep the session open until the client is done.
        let _ = socket.next().await;
    });

    let connection = Arc::new(WsConnection::new());
    let cache = TemplateCache::new(
        Arc::clone(&connection) as Arc<dyn Connection>,
        Registry::shared(),
        test_context(),
    );
    let (push_tx, _push_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(16);
    let manager = spawn_session_manager(Arc::clone(&connection), settings(addr), push_tx, event_tx);
    cache.handle_event(event_rx.recv().await.unwrap()).await;

    let recorder = Recorder::new();
    cache
        .subscribe("{{ broken }", Variables::new(), recorder.callback())
        .await;

    let last = recorder.last().unwrap();
    assert!(matches!(
        last.failure(),
        Some(templink_core::CacheError::MalformedTemplate { .. })
    ));

    manager.abort();
    server.abort();
}

#[tokio::test]
async fn test_dropped_session_reports_disconnect_and_reconnects() {
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let socket = accept(&listener, true).await;
        drop(socket);
        let mut second = accept(&listener, true).await;
        let _ = second.next().await;
    });

    let connection = Arc::new(WsConnection::new());
    let (push_tx, _push_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(16);
    let manager = spawn_session_manager(Arc::clone(&connection), settings(addr), push_tx, event_tx);

    assert_eq!(event_rx.recv().await, Some(ConnectionEvent::Connected));
    assert!(matches!(
        event_rx.recv().await,
        Some(ConnectionEvent::Disconnected { .. })
    ));
    assert_eq!(event_rx.recv().await, Some(ConnectionEvent::Connected));
    assert!(connection.is_attached());

    manager.abort();
    server.abort();
}

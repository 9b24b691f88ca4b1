//! Browser socket tests over a real listener.

use std::net::SocketAddr;
use std::time::Duration;

use almond_cloud::backend::{BackendClient, BackendConfig};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

mod common;
use common::{FakeEngine, connected_client, eventually, spawn_server, test_app, test_state};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(
    addr: SocketAddr,
    path: &str,
    user: &str,
    origin: Option<&str>,
) -> Result<Socket, tungstenite::Error> {
    let mut request = format!("ws://{addr}/api/{path}")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("X-Dev-User", user.parse().unwrap());
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert("Origin", origin.parse().unwrap());
    }
    tokio_tungstenite::connect_async(request)
        .await
        .map(|(socket, _)| socket)
}

/// Next JSON text frame, skipping pings.
async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no frame within 5s")
            .expect("socket ended")
            .expect("socket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn serve_with_engine() -> (FakeEngine, BackendClient, SocketAddr) {
    let engine = FakeEngine::start().await;
    let client = connected_client(&engine).await;
    let addr = spawn_server(test_app(test_state(client.clone()))).await;
    (engine, client, addr)
}

#[tokio::test]
async fn test_conversation_socket() {
    let (engine, client, addr) = serve_with_engine().await;
    let mut socket = connect(addr, "conversation", "alice", None).await.unwrap();

    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "text", "text": "Welcome back!"})
    );

    let opened = engine.log.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 1);
    let (id, user, options) = &opened[0];
    assert!(id.starts_with("enterprise:alice:"));
    assert_eq!(user.id, "alice");
    assert!(!user.is_owner);
    assert!(options.show_welcome);

    send_json(&mut socket, json!({"type": "command", "text": "hello"})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "text", "text": "Hello! You said hello"})
    );

    send_json(&mut socket, json!({"type": "command", "text": "choices"})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "choice", "idx": 0, "title": "Yes", "text": "yes"})
    );

    send_json(&mut socket, json!({"type": "tt", "code": "now => @weather.current();"})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "text", "text": "running now => @weather.current();"})
    );

    socket.close(None).await.unwrap();
    let id = id.clone();
    eventually(|| engine.log.closed_ids().contains(&id)).await;

    client.stop().await;
}

#[tokio::test]
async fn test_conversation_socket_reports_bad_commands() {
    let (_engine, client, addr) = serve_with_engine().await;
    let mut socket = connect(addr, "conversation", "alice", None).await.unwrap();
    next_json(&mut socket).await;

    send_json(&mut socket, json!({"type": "launch", "text": "hello"})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "error", "error": "Invalid command type launch"})
    );

    send_json(&mut socket, json!({"type": "command", "text": "fail"})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "error", "error": "Sorry, I did not understand that"})
    );

    // The socket stays usable after errors.
    send_json(&mut socket, json!({"type": "command", "text": "again"})).await;
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "text", "text": "Hello! You said again"})
    );

    client.stop().await;
}

#[tokio::test]
async fn test_conversation_socket_without_backend() {
    let client = BackendClient::new(BackendConfig::with_address("127.0.0.1:1"));
    let addr = spawn_server(test_app(test_state(client))).await;

    let mut socket = connect(addr, "conversation", "alice", None).await.unwrap();
    assert_eq!(
        next_json(&mut socket).await,
        json!({"type": "error", "error": "backend unavailable"})
    );
}

#[tokio::test]
async fn test_results_socket() {
    let (engine, client, addr) = serve_with_engine().await;
    let mut socket = connect(addr, "results", "alice", None).await.unwrap();

    eventually(|| engine.log.output_count() == 1).await;
    let results = engine.push_result(r#"{"result":"sunny"}"#).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(next_json(&mut socket).await, json!({"result": "sunny"}));

    socket.close(None).await.unwrap();
    eventually(|| engine.log.output_count() == 0).await;
    assert_eq!(engine.log.removed_outputs.lock().unwrap().len(), 1);

    client.stop().await;
}

#[tokio::test]
async fn test_cross_site_upgrade_is_rejected() {
    let (engine, client, addr) = serve_with_engine().await;

    let err = connect(addr, "conversation", "alice", Some("https://evil.example"))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), tungstenite::http::StatusCode::FORBIDDEN);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
    assert!(engine.log.opened_ids().is_empty());

    let socket = connect(addr, "conversation", "alice", Some("http://127.0.0.1:8080")).await;
    assert!(socket.is_ok());

    client.stop().await;
}

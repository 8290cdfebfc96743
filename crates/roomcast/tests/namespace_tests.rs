//! Integration tests for the connection pipeline and socket lifecycle.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use roomcast::errors::TransportError;
use roomcast::packet::PacketKind;
use roomcast::transport::ReadyState;
use roomcast::{
    DisconnectReason, MiddlewareError, Room, Server, ServerOptions, Socket, SocketError,
};
use roomcast_test_utils::{MockConnection, TestClient};
use serde_json::{json, Value};
use tokio::time::sleep;

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

// ============================================================================
// Middleware
// ============================================================================

#[tokio::test]
async fn test_middleware_chain_stops_at_first_rejection() {
    let server = Server::default();
    let ran = log();
    let connected = log();

    for (name, verdict) in [("first", None), ("second", Some("nope")), ("third", None)] {
        let ran = ran.clone();
        server.use_middleware(move |_socket| {
            let ran = ran.clone();
            async move {
                ran.lock().unwrap().push(name.to_string());
                match verdict {
                    Some(message) => Err(MiddlewareError::new(message)),
                    None => Ok(()),
                }
            }
        });
    }
    {
        let connected = connected.clone();
        server.on_connection(move |socket| {
            let connected = connected.clone();
            async move { connected.lock().unwrap().push(socket.id().to_string()) }
        });
    }

    let client = TestClient::accept(&server).await;
    let result = client.connect("/", json!({})).await;

    assert!(matches!(result, Err(SocketError::Middleware(ref e)) if e.message == "nope"));
    assert_eq!(*ran.lock().unwrap(), vec!["first", "second"]);
    assert!(connected.lock().unwrap().is_empty());
    assert_eq!(server.of("/").socket_count(), 0);

    let errors = client.conn.packets_of(PacketKind::ConnectError);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data, vec![json!({"message": "nope"})]);
}

#[tokio::test]
async fn test_middleware_error_data_is_forwarded() {
    let server = Server::default();
    server.use_middleware(|_socket| async {
        Err(MiddlewareError::new("banned").with_data(json!({"until": "tomorrow"})))
    });

    let client = TestClient::accept(&server).await;
    let _ = client.connect("/", json!({})).await;

    let errors = client.conn.packets_of(PacketKind::ConnectError);
    assert_eq!(
        errors[0].data,
        vec![json!({"message": "banned", "data": {"until": "tomorrow"}})]
    );
}

#[tokio::test]
async fn test_legacy_rejection_sends_raw_message() {
    let server = Server::default();
    server.of("/admin").use_middleware(|_socket| async { Err(MiddlewareError::new("nope")) });

    let client = TestClient::accept_with(&server, MockConnection::legacy()).await;
    let result = client.connect("/admin", Value::Null).await;

    assert!(result.is_err());
    let errors = client.conn.packets_of(PacketKind::ConnectError);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].data, vec![json!("nope")]);
}

#[tokio::test]
async fn test_middleware_sees_handshake_auth() {
    let server = Server::default();
    server.use_middleware(|socket| async move {
        match socket.handshake().auth.get("token").and_then(Value::as_str) {
            Some("letmein") => Ok(()),
            _ => Err(MiddlewareError::new("unauthorized")),
        }
    });

    let client = TestClient::accept(&server).await;
    assert!(client.connect("/", json!({"token": "wrong"})).await.is_err());

    let socket = client.connect("/", json!({"token": "letmein"})).await.unwrap();
    assert_eq!(socket.handshake().auth, json!({"token": "letmein"}));
    assert_eq!(socket.handshake().connection_id, client.client.id());
}

#[tokio::test]
async fn test_transport_closed_during_middleware_drops_socket() {
    let server = Server::default();
    let connected = log();
    {
        let connected = connected.clone();
        server.on_connection(move |socket| {
            let connected = connected.clone();
            async move { connected.lock().unwrap().push(socket.id().to_string()) }
        });
    }

    let conn = MockConnection::new();
    {
        let conn = conn.clone();
        server.use_middleware(move |_socket| {
            let conn = conn.clone();
            async move {
                conn.set_ready_state(ReadyState::Closed);
                Ok(())
            }
        });
    }

    let client = TestClient::accept_with(&server, conn).await;
    let result = client.connect("/", json!({})).await;

    assert!(matches!(
        result,
        Err(SocketError::Transport(TransportError::Closed))
    ));
    assert!(connected.lock().unwrap().is_empty());
    assert_eq!(server.of("/").socket_count(), 0);
    assert!(client.conn.packets_of(PacketKind::Connect).is_empty());
}

#[tokio::test]
async fn test_rejection_on_closing_transport_sends_nothing() {
    let server = Server::default();
    let conn = MockConnection::new();
    {
        let conn = conn.clone();
        server.use_middleware(move |_socket| {
            let conn = conn.clone();
            async move {
                conn.set_ready_state(ReadyState::Closing);
                Err(MiddlewareError::new("nope"))
            }
        });
    }

    let client = TestClient::accept_with(&server, conn).await;
    let result = client.connect("/", json!({})).await;

    assert!(matches!(
        result,
        Err(SocketError::Transport(TransportError::Closed))
    ));
    assert!(client.conn.packets_of(PacketKind::ConnectError).is_empty());
    assert_eq!(server.of("/").socket_count(), 0);
}

// ============================================================================
// Connect
// ============================================================================

#[tokio::test]
async fn test_connection_listener_sees_registered_socket() {
    let server = Server::default();
    let seen = Arc::new(Mutex::new(None));
    {
        let handle = server.clone();
        let seen = seen.clone();
        server.on_connection(move |socket: Arc<Socket>| {
            let handle = handle.clone();
            let seen = seen.clone();
            async move {
                let nsp = handle.of("/");
                let registered = nsp.socket(socket.id()).is_some();
                let in_own_room = socket.rooms().contains(&Room::from(socket.id()));
                *seen.lock().unwrap() = Some((registered, in_own_room, socket.connected()));
            }
        });
    }

    let (client, socket) = TestClient::connected(&server, "/").await;

    assert_eq!(*seen.lock().unwrap(), Some((true, true, true)));
    let payload = client.connect_payload("/").unwrap();
    assert_eq!(payload["sid"], json!(socket.id().as_str()));
}

#[tokio::test]
async fn test_invalid_namespace_current_protocol() {
    let server = Server::default();
    let client = TestClient::accept(&server).await;

    let result = client.connect("/nowhere", json!({})).await;

    assert!(matches!(result, Err(SocketError::InvalidNamespace(ref n)) if n == "/nowhere"));
    let errors = client.conn.packets_of(PacketKind::ConnectError);
    assert_eq!(errors[0].nsp, "/nowhere");
    assert_eq!(errors[0].data, vec![json!({"message": "Invalid namespace"})]);
}

#[tokio::test]
async fn test_invalid_namespace_legacy_protocol() {
    let server = Server::default();
    let client = TestClient::accept_with(&server, MockConnection::legacy()).await;

    let _ = client.connect("/nowhere", Value::Null).await;

    let errors = client.conn.packets_of(PacketKind::ConnectError);
    assert_eq!(errors[0].data, vec![json!("Invalid namespace")]);
}

#[tokio::test]
async fn test_legacy_client_joins_root_on_accept() {
    let server = Server::default();
    let client = TestClient::accept_with(&server, MockConnection::legacy()).await;

    assert!(client.client.socket("/").is_some());
    let connects = client.conn.packets_of(PacketKind::Connect);
    assert_eq!(connects.len(), 1);
    assert!(connects[0].data.is_empty(), "legacy CONNECT carries no payload");
}

#[tokio::test]
async fn test_connect_packet_joins_namespace() {
    let server = Server::default();
    let client = TestClient::accept(&server).await;
    server.of("/chat");

    client
        .client
        .handle_packet(roomcast::Packet::connect("/chat", Some(json!({"user": "ann"}))))
        .await;

    let socket = client.client.socket("/chat").unwrap();
    assert_eq!(socket.handshake().auth, json!({"user": "ann"}));
}

#[tokio::test]
async fn test_duplicate_connect_returns_existing_socket() {
    let server = Server::default();
    let (client, first) = TestClient::connected(&server, "/").await;

    let second = client.connect("/", json!({})).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(server.of("/").socket_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_closes_idle_connection() {
    let server = Server::new(
        ServerOptions::default().with_connect_timeout(Duration::from_millis(100)),
    );
    let idle = TestClient::accept(&server).await;
    let (joined, _) = TestClient::connected(&server, "/").await;

    sleep(Duration::from_millis(150)).await;

    assert!(idle.conn.is_closed());
    assert!(!joined.conn.is_closed());
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_client_event_reaches_handler() {
    let server = Server::default();
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        server.on_connection(move |socket| {
            let received = received.clone();
            async move {
                socket.on("chat", move |_socket, args, _ack| {
                    let received = received.clone();
                    async move { received.lock().unwrap().extend(args) }
                });
            }
        });
    }

    let (client, _) = TestClient::connected(&server, "/").await;
    client.send_event("/", "chat", vec![json!("hi")], None).await;
    sleep(Duration::from_millis(1)).await;

    assert_eq!(*received.lock().unwrap(), vec![json!("hi")]);
}

#[tokio::test]
async fn test_socket_emit_and_send() {
    let server = Server::default();
    let (client, socket) = TestClient::connected(&server, "/").await;

    socket.emit("greet", vec![json!("hello")]).unwrap();
    socket.send(vec![json!("plain")]).unwrap();

    assert_eq!(client.conn.events("greet"), vec![vec![json!("hello")]]);
    assert_eq!(client.conn.events("message"), vec![vec![json!("plain")]]);
}

// ============================================================================
// Disconnect
// ============================================================================

fn record_reasons(socket: &Arc<Socket>) -> Arc<Mutex<Vec<DisconnectReason>>> {
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = reasons.clone();
    socket.on_disconnect(move |_socket, reason| {
        let sink = sink.clone();
        async move { sink.lock().unwrap().push(reason) }
    });
    reasons
}

#[tokio::test]
async fn test_client_namespace_disconnect() {
    let server = Server::default();
    let (client, socket) = TestClient::connected(&server, "/").await;
    socket.join(["room"]);
    let reasons = record_reasons(&socket);

    client
        .client
        .handle_packet(roomcast::Packet::disconnect("/"))
        .await;

    assert_eq!(*reasons.lock().unwrap(), vec![DisconnectReason::ClientNamespaceDisconnect]);
    assert!(!socket.connected());
    assert!(socket.rooms().is_empty());
    assert_eq!(server.of("/").socket_count(), 0);
    assert!(client.client.socket("/").is_none());
    assert!(!client.conn.is_closed());
}

#[tokio::test]
async fn test_server_disconnect_keeps_other_namespaces() {
    let server = Server::default();
    let (client, root) = TestClient::connected(&server, "/").await;
    let chat = client.connect("/chat", json!({})).await.unwrap();
    let reasons = record_reasons(&root);

    root.disconnect(false).await;

    assert_eq!(*reasons.lock().unwrap(), vec![DisconnectReason::ServerNamespaceDisconnect]);
    assert_eq!(client.conn.packets_of(PacketKind::Disconnect).len(), 1);
    assert!(chat.connected());
    assert!(!client.conn.is_closed());
}

#[tokio::test]
async fn test_disconnect_with_close_leaves_every_namespace() {
    let server = Server::default();
    let (client, root) = TestClient::connected(&server, "/").await;
    let chat = client.connect("/chat", json!({})).await.unwrap();

    root.disconnect(true).await;

    assert!(!root.connected());
    assert!(!chat.connected());
    assert!(client.conn.is_closed());
    assert_eq!(client.conn.close_calls(), 1);
}

#[tokio::test]
async fn test_transport_close_disconnects_every_socket() {
    let server = Server::default();
    let (client, root) = TestClient::connected(&server, "/").await;
    let chat = client.connect("/chat", json!({})).await.unwrap();
    let root_reasons = record_reasons(&root);
    let chat_reasons = record_reasons(&chat);

    client.client.on_close(DisconnectReason::TransportClose).await;

    assert_eq!(*root_reasons.lock().unwrap(), vec![DisconnectReason::TransportClose]);
    assert_eq!(*chat_reasons.lock().unwrap(), vec![DisconnectReason::TransportClose]);
    assert!(client.conn.packets_of(PacketKind::Disconnect).is_empty());
}

#[tokio::test]
async fn test_disconnected_socket_ignores_second_close() {
    let server = Server::default();
    let (client, socket) = TestClient::connected(&server, "/").await;
    let reasons = record_reasons(&socket);

    socket.disconnect(false).await;
    client.client.on_close(DisconnectReason::TransportClose).await;

    assert_eq!(reasons.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_server_close_shuts_everything_down() {
    let server = Server::default();
    let (a, sa) = TestClient::connected(&server, "/").await;
    let (b, sb) = TestClient::connected(&server, "/").await;
    let reasons = record_reasons(&sa);

    server.close().await;

    assert_eq!(*reasons.lock().unwrap(), vec![DisconnectReason::ServerShuttingDown]);
    assert!(!sa.connected() && !sb.connected());
    assert!(a.conn.is_closed() && b.conn.is_closed());
    assert_eq!(server.of("/").socket_count(), 0);
}

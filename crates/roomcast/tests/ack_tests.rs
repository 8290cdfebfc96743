//! Integration tests for acknowledgement aggregation.
//!
//! Timers run on tokio's paused clock, so every deadline is exact.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use roomcast::packet::PacketKind;
use roomcast::{
    AckError, AckOutcome, LocalAdapterBuilder, Server, ServerOptions, SocketError,
};
use roomcast_test_utils::{ClusterCall, MockCluster, RemoteServer, RemoteSocketSpec, TestClient};
use serde_json::json;
use tokio::time::{sleep, Instant};

type Recorded = Arc<Mutex<Vec<(Duration, AckOutcome)>>>;

async fn connected_clients(server: &Server, count: usize) -> Vec<TestClient> {
    let mut clients = Vec::new();
    for _ in 0..count {
        let (client, _) = TestClient::connected(server, "/").await;
        clients.push(client);
    }
    clients
}

async fn ack_last_event(client: &TestClient, reply: serde_json::Value) {
    let packet = client.conn.packets_of(PacketKind::Event).pop().unwrap();
    client.ack(&packet, vec![reply]).await;
}

fn recorder() -> (Recorded, impl FnOnce(AckOutcome) + Send + 'static) {
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    let start = Instant::now();
    (recorded, move |outcome| {
        sink.lock().unwrap().push((start.elapsed(), outcome));
    })
}

// ============================================================================
// Local recipients
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_all_acks_before_timeout_complete_once() {
    let server = Server::default();
    let clients = connected_clients(&server, 3).await;
    let (recorded, callback) = recorder();

    server
        .timeout(Duration::from_millis(50))
        .emit_with_ack_callback("ask", vec![], callback)
        .await
        .unwrap();

    for (i, client) in clients.iter().enumerate() {
        sleep(Duration::from_millis(10)).await;
        ack_last_event(client, json!(i)).await;
    }
    sleep(Duration::from_millis(100)).await;

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    let (at, outcome) = &recorded[0];
    assert!(*at >= Duration::from_millis(30) && *at < Duration::from_millis(50));
    assert!(!outcome.is_timed_out());
    assert_eq!(outcome.responses().len(), 3);
    assert!(outcome.responses().iter().all(|r| r.result.is_ok()));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_delivers_partial_results_once() {
    let server = Server::default();
    let clients = connected_clients(&server, 3).await;
    let (recorded, callback) = recorder();

    server
        .timeout(Duration::from_millis(50))
        .emit_with_ack_callback("ask", vec![], callback)
        .await
        .unwrap();

    sleep(Duration::from_millis(10)).await;
    ack_last_event(&clients[0], json!("a")).await;
    sleep(Duration::from_millis(10)).await;
    ack_last_event(&clients[1], json!("b")).await;

    sleep(Duration::from_millis(40)).await;
    ack_last_event(&clients[2], json!("late")).await;
    sleep(Duration::from_millis(10)).await;

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.len(), 1, "late response must not fire the callback again");
    let (at, outcome) = &recorded[0];
    assert!(*at >= Duration::from_millis(50) && *at < Duration::from_millis(60));
    assert!(outcome.is_timed_out());
    assert_eq!(outcome.responses().len(), 2);
    assert_eq!(outcome.clone().into_result(), Err(AckError::Timeout));
}

#[tokio::test(start_paused = true)]
async fn test_no_recipients_completes_immediately() {
    let server = Server::default();
    let outcome = server
        .to(["empty"])
        .emit_with_ack("ask", vec![])
        .await
        .unwrap();
    assert_eq!(outcome, AckOutcome::Completed(Vec::new()));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_mid_flight_is_a_per_recipient_error() {
    let server = Server::default();
    let clients = connected_clients(&server, 2).await;

    let op = server.timeout(Duration::from_millis(500));
    let pending = tokio::spawn(async move { op.emit_with_ack("ask", vec![]).await });

    sleep(Duration::from_millis(5)).await;
    ack_last_event(&clients[0], json!("ok")).await;
    clients[1]
        .client
        .on_close(roomcast::DisconnectReason::TransportClose)
        .await;

    let outcome = pending.await.unwrap().unwrap();
    assert!(!outcome.is_timed_out());
    let errors: Vec<_> = outcome
        .responses()
        .iter()
        .filter_map(|r| r.result.clone().err())
        .collect();
    assert_eq!(errors, vec![AckError::Disconnected]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_counts_as_error_response() {
    let server = Server::default();
    let clients = connected_clients(&server, 2).await;
    clients[1].conn.fail_writes(true);

    let op = server.timeout(Duration::from_millis(500));
    let pending = tokio::spawn(async move { op.emit_with_ack("ask", vec![]).await });

    sleep(Duration::from_millis(5)).await;
    ack_last_event(&clients[0], json!("ok")).await;

    let outcome = pending.await.unwrap().unwrap();
    assert!(!outcome.is_timed_out());
    assert_eq!(outcome.responses().len(), 2);
    assert!(matches!(
        outcome.responses().iter().find(|r| r.result.is_err()).unwrap().result,
        Err(AckError::Delivery(_))
    ));
}

// ============================================================================
// Single socket
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_socket_emit_with_ack_returns_client_reply() {
    let server = Server::default();
    let (client, socket) = TestClient::connected(&server, "/").await;

    let pending = tokio::spawn(async move {
        socket
            .emit_with_ack("question", vec![json!(42)], Some(Duration::from_millis(100)))
            .await
    });
    sleep(Duration::from_millis(1)).await;
    ack_last_event(&client, json!("answer")).await;

    assert_eq!(pending.await.unwrap().unwrap(), vec![json!("answer")]);
}

#[tokio::test(start_paused = true)]
async fn test_socket_emit_with_ack_times_out() {
    let server = Server::default();
    let (_client, socket) = TestClient::connected(&server, "/").await;

    let result = socket
        .emit_with_ack("question", vec![], Some(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(SocketError::Ack(AckError::Timeout))));
}

#[tokio::test(start_paused = true)]
async fn test_client_event_ack_reply() {
    let server = Server::default();
    let (client, socket) = TestClient::connected(&server, "/").await;
    socket.on("sum", |_socket, args, ack| async move {
        let total: i64 = args.iter().filter_map(serde_json::Value::as_i64).sum();
        if let Some(ack) = ack {
            ack.send(vec![json!(total)]).unwrap();
        }
    });

    client.send_event("/", "sum", vec![json!(2), json!(3)], Some(7)).await;
    sleep(Duration::from_millis(1)).await;

    let acks = client.conn.packets_of(PacketKind::Ack);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].id, Some(7));
    assert_eq!(acks[0].data, vec![json!(5)]);
}

// ============================================================================
// Cluster
// ============================================================================

fn clustered(cluster: &MockCluster) -> Server {
    Server::new(
        ServerOptions::default()
            .with_adapter(LocalAdapterBuilder::new().with_cluster(cluster.bridge())),
    )
}

#[tokio::test(start_paused = true)]
async fn test_remote_acks_are_aggregated() {
    let cluster = MockCluster::new()
        .with_server(
            RemoteServer::new("node-b")
                .with_socket(RemoteSocketSpec::new("b1").ack_after(Duration::from_millis(10)))
                .with_socket(RemoteSocketSpec::new("b2").ack_after(Duration::from_millis(20))),
        )
        .with_server(RemoteServer::new("node-c").unreachable());
    let server = clustered(&cluster);
    let clients = connected_clients(&server, 1).await;
    let (recorded, callback) = recorder();

    server
        .timeout(Duration::from_millis(100))
        .emit_with_ack_callback("ask", vec![], callback)
        .await
        .unwrap();
    sleep(Duration::from_millis(5)).await;
    ack_last_event(&clients[0], json!("local")).await;
    sleep(Duration::from_millis(200)).await;

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    let (at, outcome) = &recorded[0];
    assert!(*at < Duration::from_millis(100), "unreachable server must not be waited on");
    assert!(!outcome.is_timed_out());
    let mut sources: Vec<&str> = outcome.responses().iter().map(|r| r.source.as_str()).collect();
    sources.sort_unstable();
    assert_eq!(sources.len(), 3);
    assert!(sources.contains(&"b1") && sources.contains(&"b2"));
}

#[tokio::test(start_paused = true)]
async fn test_silent_remote_socket_times_out_with_partial_results() {
    let cluster = MockCluster::new().with_server(
        RemoteServer::new("node-b")
            .with_socket(RemoteSocketSpec::new("b1").ack_after(Duration::from_millis(10)))
            .with_socket(RemoteSocketSpec::new("b2")),
    );
    let server = clustered(&cluster);

    let outcome = server
        .timeout(Duration::from_millis(100))
        .emit_with_ack("ask", vec![])
        .await
        .unwrap();

    assert!(outcome.is_timed_out());
    assert_eq!(outcome.responses().len(), 1);
    assert_eq!(outcome.responses()[0].source, "b1");
}

#[tokio::test(start_paused = true)]
async fn test_local_flag_skips_cluster_for_acks() {
    let cluster = MockCluster::new().with_server(
        RemoteServer::new("node-b")
            .with_socket(RemoteSocketSpec::new("b1").ack_after(Duration::from_millis(10))),
    );
    let server = clustered(&cluster);
    let clients = connected_clients(&server, 1).await;

    let op = server.local().timeout(Duration::from_millis(100));
    let pending = tokio::spawn(async move { op.emit_with_ack("ask", vec![]).await });
    sleep(Duration::from_millis(5)).await;
    ack_last_event(&clients[0], json!("here")).await;

    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome.responses().len(), 1);
    assert!(cluster.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remote_socket_emit_with_ack_takes_first_reply() {
    let cluster = MockCluster::new().with_server(
        RemoteServer::new("node-b").with_socket(
            RemoteSocketSpec::new("b1").ack_with(Duration::from_millis(10), vec![json!("pong")]),
        ),
    );
    let server = clustered(&cluster);

    let sockets = server.fetch_sockets().await.unwrap();
    let remote = sockets.iter().find(|s| s.id().as_str() == "b1").unwrap();
    let reply = remote
        .emit_with_ack("ping", vec![], Duration::from_millis(50))
        .await
        .unwrap();

    assert_eq!(reply, vec![json!("pong")]);
    assert!(cluster
        .calls()
        .iter()
        .any(|c| matches!(c, ClusterCall::BroadcastWithAck { opts, .. } if opts.flags.expect_single_response)));
}

#[tokio::test(start_paused = true)]
async fn test_server_side_emit_with_ack_counts_other_servers() {
    let cluster = MockCluster::new()
        .with_server(RemoteServer::new("node-b").replying(vec![json!("b-ok")]))
        .with_server(RemoteServer::new("node-c").unreachable());
    let server = clustered(&cluster);

    let outcome = server
        .server_side_emit_with_ack("sync", vec![json!(1)], Some(Duration::from_millis(100)))
        .await
        .unwrap();

    assert!(!outcome.is_timed_out());
    assert_eq!(outcome.responses().len(), 1);
    assert_eq!(outcome.responses()[0].source, "node-b");
    assert_eq!(outcome.responses()[0].result, Ok(vec![json!("b-ok")]));
}

#[tokio::test(start_paused = true)]
async fn test_server_side_emit_alone_completes_empty() {
    let server = Server::default();
    let outcome = server
        .server_side_emit_with_ack("sync", vec![], None)
        .await
        .unwrap();
    assert_eq!(outcome, AckOutcome::Completed(Vec::new()));
}

// ============================================================================
// Cluster failure
// ============================================================================

fn downed_cluster() -> MockCluster {
    MockCluster::new()
        .with_server(
            RemoteServer::new("node-b")
                .with_socket(RemoteSocketSpec::new("b1").ack_after(Duration::from_millis(1))),
        )
        .with_server(RemoteServer::new("node-c"))
        .failing()
}

#[tokio::test(start_paused = true)]
async fn test_failed_bridge_does_not_hold_local_acks() {
    let cluster = downed_cluster();
    let server = clustered(&cluster);
    let clients = connected_clients(&server, 1).await;
    let (recorded, callback) = recorder();

    server
        .timeout(Duration::from_millis(500))
        .emit_with_ack_callback("ask", vec![], callback)
        .await
        .unwrap();
    sleep(Duration::from_millis(5)).await;
    ack_last_event(&clients[0], json!("local")).await;
    sleep(Duration::from_millis(600)).await;

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    let (at, outcome) = &recorded[0];
    assert!(*at < Duration::from_millis(10), "completed at {at:?}, not at the deadline");
    assert!(!outcome.is_timed_out());
    assert_eq!(outcome.responses().len(), 1);
    assert_eq!(outcome.responses()[0].result, Ok(vec![json!("local")]));
    assert!(cluster
        .calls()
        .iter()
        .any(|c| matches!(c, ClusterCall::BroadcastWithAck { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_failed_bridge_without_timeout_still_completes() {
    let server = clustered(&downed_cluster());
    let clients = connected_clients(&server, 2).await;

    let op = server.except(["muted"]);
    let pending = tokio::spawn(async move { op.emit_with_ack("ask", vec![]).await });
    sleep(Duration::from_millis(5)).await;
    ack_last_event(&clients[0], json!(0)).await;
    ack_last_event(&clients[1], json!(1)).await;

    let outcome = pending.await.unwrap().unwrap();
    assert!(!outcome.is_timed_out());
    assert_eq!(outcome.responses().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_bridge_fails_server_side_emit() {
    let server = clustered(&downed_cluster());

    let result = server
        .server_side_emit_with_ack("sync", vec![], Some(Duration::from_millis(100)))
        .await;

    assert!(matches!(result, Err(SocketError::Cluster(_))));
}

//! Integration tests for parent namespaces and adapter replacement.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use regex::Regex;
use roomcast::packet::PacketKind;
use roomcast::{LocalAdapterBuilder, MiddlewareError, Room, Server, ServerOptions, SocketError};
use roomcast_test_utils::{ClusterCall, MockCluster, TestClient};
use serde_json::{json, Value};

fn workspace_pattern() -> Regex {
    Regex::new(r"^/workspace-\d+$").unwrap()
}

// ============================================================================
// Child creation
// ============================================================================

#[tokio::test]
async fn test_regex_parent_creates_child_with_inherited_handlers() {
    let server = Server::default();
    let parent = server.of_regex(workspace_pattern());
    let greeted = Arc::new(Mutex::new(Vec::new()));

    parent.use_middleware(|socket| async move {
        if socket.handshake().auth.get("badge").is_some() {
            Ok(())
        } else {
            Err(MiddlewareError::new("no badge"))
        }
    });
    {
        let greeted = greeted.clone();
        parent.on_connection(move |socket| {
            let greeted = greeted.clone();
            async move { greeted.lock().unwrap().push(socket.nsp().name().to_string()) }
        });
    }

    let client = TestClient::accept(&server).await;
    assert!(matches!(
        client.connect("/workspace-1", json!({})).await,
        Err(SocketError::Middleware(_))
    ));
    client
        .connect("/workspace-1", json!({"badge": 7}))
        .await
        .unwrap();

    assert_eq!(*greeted.lock().unwrap(), vec!["/workspace-1"]);
    assert!(parent.child("/workspace-1").is_some());
    assert!(parent.name().starts_with("/_"));
}

#[tokio::test]
async fn test_children_are_cached_by_name() {
    let server = Server::default();
    let parent = server.of_regex(workspace_pattern());
    let created = Arc::new(AtomicUsize::new(0));
    {
        let created = created.clone();
        server.on_new_namespace(move |_nsp| {
            created.fetch_add(1, Ordering::SeqCst);
        });
    }

    let (_, first) = TestClient::connected(&server, "/workspace-3").await;
    let (_, second) = TestClient::connected(&server, "/workspace-3").await;

    assert!(Arc::ptr_eq(first.nsp(), second.nsp()));
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(parent.children().len(), 1);
    assert!(Arc::ptr_eq(&server.of("/workspace-3"), first.nsp()));
}

#[tokio::test]
async fn test_non_matching_name_is_invalid() {
    let server = Server::default();
    server.of_regex(workspace_pattern());

    let client = TestClient::accept(&server).await;
    let result = client.connect("/workspace-x", json!({})).await;

    assert!(matches!(result, Err(SocketError::InvalidNamespace(_))));
    assert_eq!(client.conn.packets_of(PacketKind::ConnectError).len(), 1);
}

#[tokio::test]
async fn test_parents_are_tried_in_registration_order() {
    let server = Server::default();
    let broad = server.of_regex(Regex::new(r"^/team-").unwrap());
    let narrow = server.of_regex(Regex::new(r"^/team-red$").unwrap());

    TestClient::connected(&server, "/team-red").await;

    assert!(broad.child("/team-red").is_some());
    assert!(narrow.children().is_empty());
}

#[tokio::test]
async fn test_predicate_parent_uses_auth() {
    let server = Server::default();
    let parent = server.of_fn(|name: String, auth: Value| async move {
        auth.get("tenant").and_then(Value::as_str) == name.strip_prefix("/tenant/")
    });

    let client = TestClient::accept(&server).await;
    assert!(client
        .connect("/tenant/acme", json!({"tenant": "globex"}))
        .await
        .is_err());
    assert!(parent.children().is_empty());

    client
        .connect("/tenant/acme", json!({"tenant": "acme"}))
        .await
        .unwrap();
    assert!(parent.child("/tenant/acme").is_some());
}

// ============================================================================
// Parent broadcasts
// ============================================================================

#[tokio::test]
async fn test_parent_emit_reaches_every_child() {
    let server = Server::default();
    let parent = server.of_regex(workspace_pattern());
    let (one, s1) = TestClient::connected(&server, "/workspace-1").await;
    let (two, _) = TestClient::connected(&server, "/workspace-2").await;
    let (root, _) = TestClient::connected(&server, "/").await;
    s1.join(["ops"]);

    parent.emit("maintenance", vec![json!("soon")]).await.unwrap();
    parent.to(["ops"]).emit("page", vec![]).await.unwrap();

    assert_eq!(one.conn.events("maintenance"), vec![vec![json!("soon")]]);
    assert_eq!(two.conn.events("maintenance").len(), 1);
    assert!(root.conn.events("maintenance").is_empty());
    assert_eq!(one.conn.events("page").len(), 1);
    assert!(two.conn.events("page").is_empty());
    assert!(s1.rooms().contains(&Room::new("ops")));
}

#[tokio::test]
async fn test_parent_rejects_cluster_queries() {
    let server = Server::default();
    let parent = server.of_regex(workspace_pattern());

    assert!(matches!(
        parent.fetch_sockets().await,
        Err(SocketError::UnsupportedOnParent("fetch_sockets()"))
    ));
    assert!(matches!(
        parent.server_side_emit("sync", vec![]).await,
        Err(SocketError::UnsupportedOnParent("server_side_emit()"))
    ));
}

// ============================================================================
// Cleanup
// ============================================================================

#[tokio::test]
async fn test_empty_child_removed_when_cleanup_enabled() {
    let server = Server::new(ServerOptions::default().with_cleanup_empty_child_namespaces(true));
    let parent = server.of_regex(workspace_pattern());
    let (_, a) = TestClient::connected(&server, "/workspace-9").await;
    let (_, b) = TestClient::connected(&server, "/workspace-9").await;

    a.disconnect(false).await;
    assert!(parent.child("/workspace-9").is_some(), "one socket left");

    b.disconnect(false).await;
    assert!(parent.child("/workspace-9").is_none());
    assert!(server.namespaces().iter().all(|n| n.name() != "/workspace-9"));

    let (_, again) = TestClient::connected(&server, "/workspace-9").await;
    assert!(!Arc::ptr_eq(again.nsp(), a.nsp()), "recreated on the next connection");
}

#[tokio::test]
async fn test_empty_child_kept_by_default() {
    let server = Server::default();
    let parent = server.of_regex(workspace_pattern());
    let (_, socket) = TestClient::connected(&server, "/workspace-9").await;

    socket.disconnect(false).await;

    assert!(parent.child("/workspace-9").is_some());
    assert!(server.namespaces().iter().any(|n| n.name() == "/workspace-9"));
}

// ============================================================================
// Adapter replacement
// ============================================================================

#[tokio::test]
async fn test_set_adapter_applies_to_existing_and_future_namespaces() {
    let server = Server::default();
    let (client, socket) = TestClient::connected(&server, "/").await;
    socket.join(["vip"]);

    let cluster = MockCluster::new();
    server
        .set_adapter(LocalAdapterBuilder::new().with_cluster(cluster.bridge()))
        .await;

    server.to(["vip"]).emit("perk", vec![]).await.unwrap();
    assert_eq!(client.conn.events("perk").len(), 1, "memberships carried over");
    assert!(socket.rooms().contains(&Room::new("vip")));

    server.of("/later").emit("hello", vec![]).await.unwrap();

    let broadcasts: Vec<String> = cluster
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ClusterCall::Broadcast { nsp, .. } => Some(nsp),
            _ => None,
        })
        .collect();
    assert_eq!(broadcasts, vec!["/".to_string(), "/later".to_string()]);
}

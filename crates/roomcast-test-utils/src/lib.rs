//! # Roomcast Test Utilities
//!
//! Shared mocks and fixtures for testing the Roomcast messaging core without
//! a real transport or cluster.
//!
//! ## Modules
//!
//! - `mock_connection` - transport connection that records written frames
//! - `mock_cluster` - cluster bridge with scripted remote servers
//! - `fixtures` - ready-made servers, clients and auth payloads
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = Server::default();
//!     let (alice, socket) = TestClient::connected(&server, "/").await;
//!     socket.join(["lobby"]);
//!
//!     server.to(["lobby"]).emit("hello", vec![]).await.unwrap();
//!     assert_eq!(alice.conn.events("hello").len(), 1);
//! }
//! ```

pub mod fixtures;
pub mod mock_cluster;
pub mod mock_connection;

pub use fixtures::*;
pub use mock_cluster::{ClusterCall, MockCluster, RemoteServer, RemoteSocketSpec};
pub use mock_connection::MockConnection;

//! Top-level namespace registry and transport entry point.
//!
//! ```text
//! Server
//! ├── namespaces: "/" (always present), "/chat", "/orgs/42", ...
//! ├── parents:    "/_0" (regex), "/_1" (predicate), ...  first match wins
//! └── clients:    one per accepted transport connection
//! ```
//!
//! Namespaces created from a parent are cached here by exact name, so a
//! later connection to the same name skips the parent lookup.

use futures::FutureExt;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::adapter::ack::AckOutcome;
use crate::adapter::types::{Room, SocketId};
use crate::adapter::{AdapterBuilder, LocalAdapterBuilder, SessionAwareAdapterBuilder};
use crate::client::Client;
use crate::config::{Config, RecoveryConfig, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_PATH};
use crate::errors::{MiddlewareError, SocketError};
use crate::namespace::{Namespace, NamespaceInit};
use crate::observability::metrics;
use crate::operator::{BroadcastOperator, RemoteSocket};
use crate::packet::{JsonEncoder, PacketEncoder};
use crate::parent::{Matcher, NamespacePredicate, ParentNamespace};
use crate::socket::{DisconnectReason, Socket};
use crate::transport::{Connection, LEGACY_PROTOCOL};

/// Name of the namespace every server starts with.
pub const ROOT_NAMESPACE: &str = "/";

type NewNamespaceHandler = Arc<dyn Fn(&Arc<Namespace>) + Send + Sync>;

/// Programmatic server configuration.
#[derive(Clone)]
pub struct ServerOptions {
    /// Path the transport is mounted on; informational for the core.
    pub path: String,
    /// Delay for a client to join a namespace before it is closed.
    pub connect_timeout: Duration,
    /// Connection-state recovery, `None` when disabled.
    pub recovery: Option<RecoveryConfig>,
    /// Remove children of parent namespaces once their last socket leaves.
    pub cleanup_empty_child_namespaces: bool,
    /// Adapter used for every namespace. Defaults to the session-aware
    /// adapter when recovery is enabled, the local adapter otherwise.
    pub adapter: Option<Arc<dyn AdapterBuilder>>,
    pub encoder: Arc<dyn PacketEncoder>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            path: DEFAULT_PATH.to_string(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            recovery: None,
            cleanup_empty_child_namespaces: false,
            adapter: None,
            encoder: Arc::new(JsonEncoder),
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("path", &self.path)
            .field("connect_timeout", &self.connect_timeout)
            .field("recovery", &self.recovery)
            .field(
                "cleanup_empty_child_namespaces",
                &self.cleanup_empty_child_namespaces,
            )
            .field("custom_adapter", &self.adapter.is_some())
            .finish_non_exhaustive()
    }
}

impl ServerOptions {
    /// Options matching a loaded [`Config`]; the adapter is left to the default.
    pub fn from_config(config: &Config) -> Self {
        Self {
            path: config.path.clone(),
            connect_timeout: config.connect_timeout,
            recovery: config.recovery,
            cleanup_empty_child_namespaces: config.cleanup_empty_child_namespaces,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = Some(recovery);
        self
    }

    #[must_use]
    pub fn with_adapter(mut self, adapter: impl AdapterBuilder + 'static) -> Self {
        self.adapter = Some(Arc::new(adapter));
        self
    }

    #[must_use]
    pub fn with_encoder(mut self, encoder: impl PacketEncoder + 'static) -> Self {
        self.encoder = Arc::new(encoder);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cleanup_empty_child_namespaces(mut self, cleanup: bool) -> Self {
        self.cleanup_empty_child_namespaces = cleanup;
        self
    }

    fn adapter_builder(&self) -> Arc<dyn AdapterBuilder> {
        match (&self.adapter, self.recovery) {
            (Some(adapter), _) => adapter.clone(),
            (None, Some(recovery)) => Arc::new(SessionAwareAdapterBuilder::new(recovery)),
            (None, None) => Arc::new(LocalAdapterBuilder::new()),
        }
    }
}

pub(crate) struct ServerInner {
    encoder: Arc<dyn PacketEncoder>,
    recovery: Option<RecoveryConfig>,
    connect_timeout: Duration,
    cleanup_empty_child_namespaces: bool,
    builder: RwLock<Arc<dyn AdapterBuilder>>,
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    parents: RwLock<Vec<Arc<ParentNamespace>>>,
    parent_ids: AtomicUsize,
    new_namespace_handlers: RwLock<Vec<NewNamespaceHandler>>,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl ServerInner {
    pub(crate) fn encoder(&self) -> &Arc<dyn PacketEncoder> {
        &self.encoder
    }

    fn current_builder(&self) -> Arc<dyn AdapterBuilder> {
        self.builder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A namespace wired to the current adapter builder, not yet registered.
    pub(crate) fn build_namespace(
        &self,
        name: &str,
        parent: Option<Weak<ParentNamespace>>,
    ) -> Arc<Namespace> {
        let builder = self.current_builder();
        Namespace::new(NamespaceInit {
            name: name.to_string(),
            builder: builder.as_ref(),
            encoder: self.encoder.clone(),
            recovery: self.recovery,
            parent,
        })
    }

    /// Register `nsp` unless a namespace of that name already exists.
    ///
    /// Returns the registered namespace and whether it is `nsp`.
    pub(crate) fn insert_namespace(&self, nsp: Arc<Namespace>) -> (Arc<Namespace>, bool) {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = namespaces.get(nsp.name()) {
            return (existing.clone(), false);
        }
        namespaces.insert(nsp.name().to_string(), nsp.clone());
        metrics::set_namespaces_active(namespaces.len());
        (nsp, true)
    }

    pub(crate) fn remove_namespace(&self, name: &str) {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if namespaces.remove(name).is_some() {
            metrics::set_namespaces_active(namespaces.len());
        }
    }

    fn namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn all_namespaces(&self) -> Vec<Arc<Namespace>> {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn notify_new_namespace(&self, nsp: &Arc<Namespace>) {
        let handlers = self
            .new_namespace_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(nsp);
        }
    }

    /// Exact name first, then parent namespaces in registration order.
    pub(crate) async fn resolve_namespace(&self, name: &str, auth: &Value) -> Option<Arc<Namespace>> {
        if let Some(nsp) = self.namespace(name) {
            return Some(nsp);
        }

        let parents = self
            .parents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for parent in parents {
            if parent.matches(name, auth).await {
                return parent.create_child(name).await;
            }
        }
        None
    }

    pub(crate) fn forget_client(&self, id: &str) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

/// Real-time messaging server.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("namespaces", &self.inner.all_namespaces().len())
            .finish_non_exhaustive()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        let inner = Arc::new(ServerInner {
            builder: RwLock::new(options.adapter_builder()),
            encoder: options.encoder,
            recovery: options.recovery,
            connect_timeout: options.connect_timeout,
            cleanup_empty_child_namespaces: options.cleanup_empty_child_namespaces,
            namespaces: RwLock::new(HashMap::new()),
            parents: RwLock::new(Vec::new()),
            parent_ids: AtomicUsize::new(0),
            new_namespace_handlers: RwLock::new(Vec::new()),
            clients: Mutex::new(HashMap::new()),
        });
        let server = Self { inner };
        server.of(ROOT_NAMESPACE);
        server
    }

    /// Namespace named `name`, created on first use.
    ///
    /// A missing leading `/` is added. Creating any namespace but the root
    /// notifies `new_namespace` listeners.
    pub fn of(&self, name: &str) -> Arc<Namespace> {
        let name = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{name}")
        };

        if let Some(nsp) = self.inner.namespace(&name) {
            return nsp;
        }

        let (nsp, created) = self
            .inner
            .insert_namespace(self.inner.build_namespace(&name, None));
        if created {
            debug!(target: "roomcast.server", nsp = %name, "Namespace created");
            if name != ROOT_NAMESPACE {
                self.inner.notify_new_namespace(&nsp);
            }
        }
        nsp
    }

    /// Namespaces whose names match `pattern` are created on demand.
    pub fn of_regex(&self, pattern: Regex) -> Arc<ParentNamespace> {
        self.register_parent(Matcher::Regex(pattern))
    }

    /// Namespaces accepted by `predicate(name, auth)` are created on demand.
    pub fn of_fn<F, Fut>(&self, predicate: F) -> Arc<ParentNamespace>
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let predicate: NamespacePredicate = Arc::new(move |name, auth| predicate(name, auth).boxed());
        self.register_parent(Matcher::Predicate(predicate))
    }

    fn register_parent(&self, matcher: Matcher) -> Arc<ParentNamespace> {
        let id = self.inner.parent_ids.fetch_add(1, Ordering::Relaxed);
        let parent = ParentNamespace::new(
            format!("/_{id}"),
            matcher,
            Arc::downgrade(&self.inner),
            self.inner.cleanup_empty_child_namespaces,
        );
        self.inner
            .parents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(parent.clone());
        parent
    }

    /// Listen for namespaces created after startup, dynamic children included.
    pub fn on_new_namespace<F>(&self, handler: F)
    where
        F: Fn(&Arc<Namespace>) + Send + Sync + 'static,
    {
        self.inner
            .new_namespace_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Namespaces currently registered, root included.
    pub fn namespaces(&self) -> Vec<Arc<Namespace>> {
        self.inner.all_namespaces()
    }

    /// Replace the adapter of every existing and future namespace.
    ///
    /// Room memberships of live sockets carry over to the new adapters.
    pub async fn set_adapter(&self, builder: impl AdapterBuilder + 'static) {
        let builder: Arc<dyn AdapterBuilder> = Arc::new(builder);
        *self
            .inner
            .builder
            .write()
            .unwrap_or_else(PoisonError::into_inner) = builder.clone();

        for nsp in self.inner.all_namespaces() {
            nsp.init_adapter(builder.as_ref()).await;
        }
        info!(target: "roomcast.server", "Adapter replaced on every namespace");
    }

    /// Bind a new transport connection.
    ///
    /// Legacy clients are connected to the root namespace right away; others
    /// must send a namespace `CONNECT` before the connect timeout.
    #[instrument(skip_all, fields(connection_id = %conn.id()))]
    pub async fn accept(&self, conn: Arc<dyn Connection>) -> Arc<Client> {
        let client = Client::new(conn.clone(), Arc::downgrade(&self.inner));
        self.inner
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id().to_string(), client.clone());
        client.arm_connect_timeout(self.inner.connect_timeout);

        if conn.protocol() == LEGACY_PROTOCOL {
            if let Err(e) = client.connect(ROOT_NAMESPACE, Value::Null).await {
                debug!(target: "roomcast.server", error = %e, "Legacy client refused by root namespace");
            }
        }
        client
    }

    /// Disconnect every socket, close every connection and every adapter.
    #[instrument(skip_all)]
    pub async fn close(&self) {
        let clients: Vec<Arc<Client>> = self
            .inner
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, client)| client)
            .collect();
        info!(target: "roomcast.server", clients = clients.len(), "Shutting down");

        for client in clients {
            client.on_close(DisconnectReason::ServerShuttingDown).await;
            client.conn().close();
        }

        for nsp in self.inner.all_namespaces() {
            nsp.adapter().close().await;
        }
        if self.inner.all_namespaces().iter().any(|n| n.socket_count() > 0) {
            warn!(target: "roomcast.server", "Sockets still registered after shutdown");
        }
        info!(target: "roomcast.server", "Shutdown complete");
    }

    // ------------------------------------------------------------------
    // Root namespace shortcuts
    // ------------------------------------------------------------------

    fn root(&self) -> Arc<Namespace> {
        self.of(ROOT_NAMESPACE)
    }

    pub fn use_middleware<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MiddlewareError>> + Send + 'static,
    {
        self.root().use_middleware(f);
    }

    pub fn on_connection<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.root().on_connection(f);
    }

    pub fn to<I, R>(&self, rooms: I) -> BroadcastOperator
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.root().to(rooms)
    }

    pub fn in_<I, R>(&self, rooms: I) -> BroadcastOperator
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.root().in_(rooms)
    }

    pub fn except<I, R>(&self, rooms: I) -> BroadcastOperator
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.root().except(rooms)
    }

    pub fn local(&self) -> BroadcastOperator {
        self.root().local()
    }

    pub fn volatile(&self) -> BroadcastOperator {
        self.root().volatile()
    }

    pub fn compress(&self, compress: bool) -> BroadcastOperator {
        self.root().compress(compress)
    }

    pub fn binary(&self, binary: bool) -> BroadcastOperator {
        self.root().binary(binary)
    }

    pub fn timeout(&self, timeout: Duration) -> BroadcastOperator {
        self.root().timeout(timeout)
    }

    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        self.root().emit(event, args).await
    }

    pub async fn send(&self, args: Vec<Value>) -> Result<(), SocketError> {
        self.root().send(args).await
    }

    pub async fn fetch_sockets(&self) -> Result<Vec<RemoteSocket>, SocketError> {
        self.root().fetch_sockets().await
    }

    pub async fn sockets_join<I, R>(&self, rooms: I) -> Result<(), SocketError>
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.root().sockets_join(rooms).await
    }

    pub async fn sockets_leave<I, R>(&self, rooms: I) -> Result<(), SocketError>
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.root().sockets_leave(rooms).await
    }

    pub async fn disconnect_sockets(&self, close: bool) -> Result<(), SocketError> {
        self.root().disconnect_sockets(close).await
    }

    pub async fn all_sockets(&self) -> Result<HashSet<SocketId>, SocketError> {
        self.root().all_sockets().await
    }

    pub async fn server_side_emit(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        self.root().server_side_emit(event, args).await
    }

    pub async fn server_side_emit_with_ack(
        &self,
        event: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<AckOutcome, SocketError> {
        self.root()
            .server_side_emit_with_ack(event, args, timeout)
            .await
    }
}

//! Parent namespaces: lazily create child namespaces whose names match a
//! regex or an async predicate.
//!
//! A child inherits the middleware and connection listeners registered on
//! its parent at the time it is created, and is cached by exact name in the
//! server registry afterwards. Broadcasts issued on the parent fan out to
//! every child.

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, info};

use crate::adapter::types::Room;
use crate::errors::{MiddlewareError, SocketError};
use crate::namespace::{
    boxed_connection_handler, boxed_middleware, ConnectionHandler, Middleware, Namespace,
};
use crate::operator::{BroadcastOperator, RemoteSocket};
use crate::server::ServerInner;
use crate::socket::Socket;

/// Async allow/deny decision for a namespace name and the client's auth payload.
pub type NamespacePredicate =
    Arc<dyn Fn(String, Value) -> BoxFuture<'static, bool> + Send + Sync>;

pub(crate) enum Matcher {
    Regex(Regex),
    Predicate(NamespacePredicate),
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
            Matcher::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

pub struct ParentNamespace {
    name: String,
    matcher: Matcher,
    server: Weak<ServerInner>,
    middlewares: RwLock<Vec<Middleware>>,
    connection_handlers: RwLock<Vec<ConnectionHandler>>,
    children: RwLock<HashMap<String, Arc<Namespace>>>,
    cleanup_empty_children: bool,
}

impl fmt::Debug for ParentNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentNamespace")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .field("children", &self.children().len())
            .finish_non_exhaustive()
    }
}

impl ParentNamespace {
    pub(crate) fn new(
        name: String,
        matcher: Matcher,
        server: Weak<ServerInner>,
        cleanup_empty_children: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            matcher,
            server,
            middlewares: RwLock::new(Vec::new()),
            connection_handlers: RwLock::new(Vec::new()),
            children: RwLock::new(HashMap::new()),
            cleanup_empty_children,
        })
    }

    /// Internal name, `/_<n>`; never reachable by clients.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Middleware for children created from now on.
    pub fn use_middleware<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MiddlewareError>> + Send + 'static,
    {
        self.middlewares
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(boxed_middleware(f));
    }

    /// Connection listener for children created from now on.
    pub fn on_connection<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.connection_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(boxed_connection_handler(f));
    }

    /// Child namespaces currently alive.
    pub fn children(&self) -> Vec<Arc<Namespace>> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn child(&self, name: &str) -> Option<Arc<Namespace>> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Broadcast operator over every current child.
    pub fn broadcast(&self) -> ParentBroadcast {
        ParentBroadcast {
            operators: self
                .children()
                .into_iter()
                .map(BroadcastOperator::new)
                .collect(),
        }
    }

    pub fn to<I, R>(&self, rooms: I) -> ParentBroadcast
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.broadcast().to(rooms)
    }

    pub fn except<I, R>(&self, rooms: I) -> ParentBroadcast
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.broadcast().except(rooms)
    }

    /// Emit to every socket of every child.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        self.broadcast().emit(event, args).await
    }

    /// Not available on a parent: query each child instead.
    pub async fn fetch_sockets(&self) -> Result<Vec<RemoteSocket>, SocketError> {
        Err(SocketError::UnsupportedOnParent("fetch_sockets()"))
    }

    /// Not available on a parent: emit from a child instead.
    pub async fn server_side_emit(&self, _event: &str, _args: Vec<Value>) -> Result<(), SocketError> {
        Err(SocketError::UnsupportedOnParent("server_side_emit()"))
    }

    pub(crate) async fn matches(&self, name: &str, auth: &Value) -> bool {
        match &self.matcher {
            Matcher::Regex(re) => re.is_match(name),
            Matcher::Predicate(predicate) => predicate(name.to_string(), auth.clone()).await,
        }
    }

    /// Create (or return the already cached) child named `name`.
    ///
    /// Handlers are copied before the child becomes visible in the server
    /// registry, so no socket can reach it without the parent's middleware.
    pub(crate) async fn create_child(self: &Arc<Self>, name: &str) -> Option<Arc<Namespace>> {
        let server = self.server.upgrade()?;

        let candidate = server.build_namespace(name, Some(Arc::downgrade(self)));
        candidate.inherit(
            self.middlewares
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            self.connection_handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        );

        let (nsp, created) = server.insert_namespace(candidate.clone());
        if !created {
            candidate.adapter().close().await;
            return Some(nsp);
        }

        self.children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), nsp.clone());
        info!(target: "roomcast.server", parent = %self.name, nsp = %name, "Child namespace created");
        server.notify_new_namespace(&nsp);
        Some(nsp)
    }

    /// Called by a child whose last socket left.
    pub(crate) async fn on_child_empty(&self, name: &str) {
        if !self.cleanup_empty_children {
            return;
        }
        let removed = self
            .children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        let Some(child) = removed else {
            return;
        };

        if let Some(server) = self.server.upgrade() {
            server.remove_namespace(name);
        }
        child.adapter().close().await;
        debug!(target: "roomcast.server", parent = %self.name, nsp = %name, "Empty child namespace removed");
    }
}

/// Broadcast operator that fans out to every child of a parent namespace.
#[derive(Debug, Clone)]
pub struct ParentBroadcast {
    operators: Vec<BroadcastOperator>,
}

impl ParentBroadcast {
    fn map(&self, f: impl Fn(&BroadcastOperator) -> BroadcastOperator) -> Self {
        Self {
            operators: self.operators.iter().map(f).collect(),
        }
    }

    #[must_use]
    pub fn to<I, R>(&self, rooms: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        let rooms: Vec<Room> = rooms.into_iter().map(Into::into).collect();
        self.map(|op| op.to(rooms.iter().cloned()))
    }

    #[must_use]
    pub fn except<I, R>(&self, rooms: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        let rooms: Vec<Room> = rooms.into_iter().map(Into::into).collect();
        self.map(|op| op.except(rooms.iter().cloned()))
    }

    #[must_use]
    pub fn local(&self) -> Self {
        self.map(BroadcastOperator::local)
    }

    #[must_use]
    pub fn volatile(&self) -> Self {
        self.map(BroadcastOperator::volatile)
    }

    #[must_use]
    pub fn compress(&self, compress: bool) -> Self {
        self.map(|op| op.compress(compress))
    }

    #[must_use]
    pub fn binary(&self, binary: bool) -> Self {
        self.map(|op| op.binary(binary))
    }

    /// Emit through every child; the first error is returned after all
    /// children were attempted.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), SocketError> {
        let mut first_error = None;
        for op in &self.operators {
            if let Err(e) = op.emit(event, args.clone()).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn disconnect_sockets(&self, close: bool) -> Result<(), SocketError> {
        for op in &self.operators {
            op.disconnect_sockets(close).await?;
        }
        Ok(())
    }
}

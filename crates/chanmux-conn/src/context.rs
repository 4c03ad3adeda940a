//! Owner of every connection in a process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::ConnectionContext;
use crate::error::{ConnError, Result};

struct ContextInner {
    config: ConnectionConfig,
    connections: Mutex<HashMap<String, ConnectionContext>>,
    shutdown: CancellationToken,
}

impl ContextInner {
    fn connections(&self) -> MutexGuard<'_, HashMap<String, ConnectionContext>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop `conn` from the map unless the address has since been reused.
    fn forget(&self, conn: &ConnectionContext) {
        let mut connections = self.connections();
        if connections.get(conn.peer()).map(ConnectionContext::id) == Some(conn.id()) {
            connections.remove(conn.peer());
            debug!(conn_id = conn.id(), peer = conn.peer(), "connection removed");
        }
    }
}

/// Tracks connections by peer address and shuts them all down together.
///
/// Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                connections: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Configuration applied to every attached connection.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Start a connection to `peer` over `stream`.
    pub fn attach<S>(&self, peer: impl Into<String>, stream: S) -> Result<ConnectionContext>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.attach_parts(peer, reader, writer)
    }

    /// Start a connection over separately owned read and write halves, such as
    /// the ones `TcpStream::into_split` returns.
    pub fn attach_parts<R, W>(
        &self,
        peer: impl Into<String>,
        reader: R,
        writer: W,
    ) -> Result<ConnectionContext>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let peer = peer.into();
        let mut connections = self.inner.connections();
        if self.inner.shutdown.is_cancelled() {
            return Err(ConnError::ShuttingDown);
        }
        if connections.contains_key(&peer) {
            warn!(peer = %peer, "peer already attached");
            return Err(ConnError::AlreadyAttached(peer));
        }

        let conn = ConnectionContext::start(
            peer.clone(),
            reader,
            writer,
            self.inner.config.clone(),
            Some(self.inner.shutdown.clone()),
        )?;
        connections.insert(peer, conn.clone());
        drop(connections);

        let inner: Weak<ContextInner> = Arc::downgrade(&self.inner);
        let watched = conn.clone();
        tokio::spawn(async move {
            watched.closed().await;
            if let Some(inner) = inner.upgrade() {
                inner.forget(&watched);
            }
        });

        Ok(conn)
    }

    pub fn connection(&self, peer: &str) -> Option<ConnectionContext> {
        self.inner.connections().get(peer).cloned()
    }

    /// Attached peer addresses, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.connections().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.inner.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Shut every connection down gracefully and wait for them to finish.
    /// Later attaches fail with [`ConnError::ShuttingDown`].
    pub async fn shutdown(&self) {
        let connections: Vec<ConnectionContext> = {
            let mut connections = self.inner.connections();
            self.inner.shutdown.cancel();
            connections.drain().map(|(_, conn)| conn).collect()
        };
        info!(connections = connections.len(), "context shutting down");
        join_all(connections.iter().map(|conn| conn.finish())).await;
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("peers", &self.peers())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

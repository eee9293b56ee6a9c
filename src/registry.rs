//! Live extension connections and the single "active" one.
//!
//! Outbound requests always go to the active connection. The first admitted
//! connection becomes active; when the active one is removed, the oldest
//! remaining connection takes over.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::protocol::RequestId;

pub type ConnectionId = String;

/// An encoded request waiting to be written to the socket. The id travels
/// with the frame so a failed write can fail the matching pending entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub request_id: RequestId,
    pub text: String,
}

/// One admitted extension connection.
///
/// Holds the outbound half of the transport: frames queued here are written
/// to the socket by the connection's handler task. Once that task exits the
/// queue closes and [`Connection::is_closed`] reports `true`.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue the frame for request `request_id`.
    pub fn send(&self, request_id: RequestId, text: String) -> Result<(), BridgeError> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::ConnectionLost(self.id.clone()));
        }
        self.outbound
            .send(OutboundFrame { request_id, text })
            .map_err(|_| BridgeError::ConnectionLost(self.id.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed() || self.cancel.is_cancelled()
    }

    /// Ask the handler task to close the socket and exit.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Admission order; the first entry is the failover target.
    connections: Vec<Arc<Connection>>,
    active: Option<ConnectionId>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    count_tx: Arc<watch::Sender<usize>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            count_tx: Arc::new(count_tx),
        }
    }

    /// Register a new connection under a freshly generated id. The connection
    /// becomes active only if none is active yet.
    pub fn admit(
        &self,
        peer: Option<SocketAddr>,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        cancel: CancellationToken,
    ) -> Arc<Connection> {
        let connection = Arc::new(Connection {
            id: format!("client_{}", Uuid::new_v4().simple()),
            peer,
            outbound,
            cancel,
        });

        let count = {
            let mut inner = self.inner.write();
            inner.connections.push(Arc::clone(&connection));
            if inner.active.is_none() {
                inner.active = Some(connection.id.clone());
                tracing::info!(connection = %connection.id, "connection is now active");
            }
            inner.connections.len()
        };
        self.count_tx.send_replace(count);

        tracing::info!(
            connection = %connection.id,
            peer = ?peer,
            total = count,
            "extension connected"
        );
        connection
    }

    /// Deregister a connection, failing over the active pointer if needed.
    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let (removed, count) = {
            let mut inner = self.inner.write();
            let position = inner.connections.iter().position(|c| c.id == id)?;
            let removed = inner.connections.remove(position);

            if inner.active.as_deref() == Some(id) {
                inner.active = inner.connections.first().map(|c| c.id.clone());
                match &inner.active {
                    Some(next) => {
                        tracing::info!(from = %id, to = %next, "active connection failed over")
                    }
                    None => tracing::info!(connection = %id, "no active connection remaining"),
                }
            }
            (removed, inner.connections.len())
        };
        self.count_tx.send_replace(count);

        tracing::info!(connection = %id, total = count, "extension disconnected");
        Some(removed)
    }

    /// Remove every connection and clear the active pointer.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let drained = {
            let mut inner = self.inner.write();
            inner.active = None;
            std::mem::take(&mut inner.connections)
        };
        self.count_tx.send_replace(0);
        drained
    }

    pub fn active(&self) -> Option<Arc<Connection>> {
        let inner = self.inner.read();
        let active = inner.active.as_deref()?;
        inner.connections.iter().find(|c| c.id == active).cloned()
    }

    pub fn active_id(&self) -> Option<ConnectionId> {
        self.inner.read().active.clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner
            .read()
            .connections
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Connection ids in admission order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner
            .read()
            .connections
            .iter()
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch the number of registered connections.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }

    /// Wait until some connection is active, up to `timeout`.
    pub async fn wait_for_active(&self, timeout: Duration) -> Option<Arc<Connection>> {
        let mut count_rx = self.count_tx.subscribe();
        let wait = async {
            loop {
                if let Some(connection) = self.active() {
                    return Some(connection);
                }
                count_rx.changed().await.ok()?;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }
}

//! Request/response correlation over the active connection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::BridgeError;
use crate::pending::PendingTable;
use crate::protocol::{encode_request, RequestId, ResponseData};
use crate::registry::{Connection, ConnectionRegistry};

/// Sends requests to the active extension and awaits their responses.
///
/// Ids come from a counter that is read and bumped under the same lock as
/// the active-connection lookup, so concurrent callers never share an id and
/// never race each other on failover. Everything after id allocation runs
/// without that lock, letting any number of requests be in flight at once.
pub struct RequestCorrelator {
    registry: ConnectionRegistry,
    pending: PendingTable,
    next_id: Mutex<RequestId>,
}

impl RequestCorrelator {
    pub fn new(registry: ConnectionRegistry, pending: PendingTable) -> Self {
        Self {
            registry,
            pending,
            next_id: Mutex::new(1),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Send one request and wait up to `timeout` for its response.
    pub async fn send_request(
        &self,
        message_type: &str,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<ResponseData, BridgeError> {
        let (connection, id) = self.reserve()?;

        // Dropping the handle on any early return removes the entry.
        let handle = self.pending.register(id, Instant::now() + timeout)?;
        let frame = encode_request(id, message_type, data.as_ref())?;

        if let Err(e) = connection.send(id, frame) {
            tracing::warn!(
                request_id = id,
                connection = %connection.id(),
                "failed to send request, connection lost"
            );
            return Err(e);
        }
        tracing::debug!(
            request_id = id,
            connection = %connection.id(),
            message_type,
            "request sent"
        );

        match handle.wait().await {
            Some(result) => result,
            None => {
                tracing::warn!(request_id = id, message_type, ?timeout, "request timed out");
                Err(BridgeError::Timeout {
                    id,
                    request_type: message_type.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Pick the active connection and allocate the next id.
    fn reserve(&self) -> Result<(Arc<Connection>, RequestId), BridgeError> {
        let mut next_id = self.next_id.lock();

        let connection = self
            .registry
            .active()
            .ok_or(BridgeError::NoActiveConnection)?;

        if connection.is_closed() {
            tracing::warn!(connection = %connection.id(), "active connection is closed, evicting");
            self.registry.remove(connection.id());
            return Err(BridgeError::ConnectionClosed(connection.id().to_string()));
        }

        let id = *next_id;
        *next_id += 1;
        Ok((connection, id))
    }
}

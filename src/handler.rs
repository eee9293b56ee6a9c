//! Per-connection loop: reads frames from the extension, writes queued
//! requests to it, and resolves pending requests as responses arrive.

use std::net::SocketAddr;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::pending::PendingTable;
use crate::protocol::{decode_envelope, message_type, response_from_envelope, RequestId};
use crate::registry::{ConnectionRegistry, OutboundFrame};

/// What happened to a single inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Completed the pending request with the response data.
    Resolved(RequestId),
    /// Completed the pending request with the peer's error.
    Failed(RequestId),
    /// No request was waiting for this id; the frame was discarded.
    Unmatched(RequestId),
    /// A well-formed frame of a type the server does not handle.
    Unhandled(String),
    /// The frame could not be decoded and was dropped.
    Malformed,
}

/// Process one inbound text frame. Never fails: malformed and unexpected
/// frames are logged and dropped, leaving the connection open.
pub fn handle_text_frame(pending: &PendingTable, connection_id: &str, text: &str) -> FrameOutcome {
    let envelope = match decode_envelope(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(connection = %connection_id, error = %e, "dropping malformed frame");
            return FrameOutcome::Malformed;
        }
    };

    if envelope.message_type != message_type::RESPONSE {
        tracing::info!(
            connection = %connection_id,
            id = envelope.id,
            message_type = %envelope.message_type,
            "unhandled inbound message"
        );
        return FrameOutcome::Unhandled(envelope.message_type);
    }

    let response = match response_from_envelope(envelope) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(connection = %connection_id, error = %e, "dropping malformed response");
            return FrameOutcome::Malformed;
        }
    };

    let id = response.id;
    let remote_error = response.data.error_message().map(str::to_owned);
    let (matched, outcome) = match remote_error {
        Some(message) => (
            pending.fail(id, BridgeError::Remote(message)),
            FrameOutcome::Failed(id),
        ),
        None => (pending.resolve(id, response.data), FrameOutcome::Resolved(id)),
    };

    if matched {
        tracing::debug!(connection = %connection_id, request_id = id, "response delivered");
        outcome
    } else {
        tracing::warn!(
            connection = %connection_id,
            request_id = id,
            "response for unknown or already completed request, discarding"
        );
        FrameOutcome::Unmatched(id)
    }
}

/// Run one extension connection until the peer goes away or `cancel` fires.
///
/// The connection is admitted into the registry on entry and removed on
/// exit, however the loop ends.
pub async fn run_connection(
    socket: WebSocket,
    peer: Option<SocketAddr>,
    registry: ConnectionRegistry,
    pending: PendingTable,
    cancel: CancellationToken,
) {
    if cancel.is_cancelled() {
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let connection_id = registry.admit(peer, outbound_tx, cancel.clone()).id().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let close_frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: "server closing connection".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                let _ = ws_tx.flush().await;
                break "cancelled";
            }

            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = ws_tx.send(Message::Text(frame.text.into())).await {
                    tracing::warn!(
                        connection = %connection_id,
                        request_id = frame.request_id,
                        error = %e,
                        "write to extension failed"
                    );
                    pending.fail(
                        frame.request_id,
                        BridgeError::ConnectionLost(connection_id.clone()),
                    );
                    break "write failed";
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(&pending, &connection_id, text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        tracing::warn!(
                            connection = %connection_id,
                            len = data.len(),
                            "ignoring binary frame"
                        );
                    }
                    Some(Ok(Message::Close(_))) | None => break "closed by peer",
                    Some(Ok(_)) => continue, // Ping/Pong handled by axum
                    Some(Err(e)) => {
                        tracing::debug!(
                            connection = %connection_id,
                            error = %e,
                            "read from extension failed"
                        );
                        break "read error";
                    }
                }
            }
        }
    };

    let cancelled = cancel.is_cancelled();
    let unsent = fail_unsent(&mut outbound_rx, &pending, || {
        if cancelled {
            BridgeError::shutting_down()
        } else {
            BridgeError::ConnectionLost(connection_id.clone())
        }
    });
    if unsent > 0 {
        tracing::warn!(
            connection = %connection_id,
            unsent,
            "failed requests that were never written"
        );
    }

    registry.remove(&connection_id);
    tracing::debug!(connection = %connection_id, reason, "connection handler exited");
}

/// Close the outbound queue and fail every request still sitting in it.
/// Returns how many were failed.
pub(crate) fn fail_unsent(
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    pending: &PendingTable,
    make_error: impl Fn() -> BridgeError,
) -> usize {
    outbound_rx.close();
    let mut failed = 0;
    while let Ok(frame) = outbound_rx.try_recv() {
        if pending.fail(frame.request_id, make_error()) {
            failed += 1;
        }
    }
    failed
}

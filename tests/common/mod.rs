#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use pagelink::config::{BridgeConfig, RequestConfig, ServerConfig};
use pagelink::Bridge;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Config bound to an ephemeral loopback port with short deadlines.
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            shutdown_timeout_secs: 2.0,
        },
        requests: RequestConfig {
            state_timeout_secs: 5.0,
            action_timeout_secs: 5.0,
        },
    }
}

/// Start a bridge on an ephemeral port and return it with its address.
pub async fn start_bridge() -> (Bridge, SocketAddr) {
    start_bridge_with(test_config()).await
}

pub async fn start_bridge_with(config: BridgeConfig) -> (Bridge, SocketAddr) {
    let bridge = Bridge::new(config);
    bridge.start().await.expect("bridge failed to start");
    let addr = bridge.server().local_addr().expect("no bound address");
    (bridge, addr)
}

/// Wait until exactly `n` connections are registered.
pub async fn wait_for_connections(bridge: &Bridge, n: usize) {
    let mut count = bridge.server().registry().subscribe();
    tokio::time::timeout(Duration::from_secs(5), count.wait_for(|c| *c == n))
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for {} connections", n))
        .expect("registry dropped");
}

/// Test double for the browser extension: a raw WebSocket client that the
/// test drives frame by frame.
pub struct FakeExtension {
    ws: WsStream,
}

impl FakeExtension {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{}/", addr))
            .await
            .expect("failed to connect");
        Self { ws }
    }

    /// Connect and wait until the server has registered this connection
    /// as its `n`th.
    pub async fn connect_nth(bridge: &Bridge, addr: SocketAddr, n: usize) -> Self {
        let ext = Self::connect(addr).await;
        wait_for_connections(bridge, n).await;
        ext
    }

    /// Next request from the server as raw JSON.
    pub async fn recv_request(&mut self) -> Value {
        self.try_recv_request(Duration::from_secs(5))
            .await
            .expect("timeout waiting for request")
    }

    pub async fn try_recv_request(&mut self, timeout: Duration) -> Option<Value> {
        loop {
            let msg = match tokio::time::timeout(timeout, self.ws.next()).await {
                Ok(Some(Ok(msg))) => msg,
                _ => return None,
            };
            match msg {
                Message::Text(text) => {
                    return Some(serde_json::from_str(text.as_str()).expect("invalid JSON"))
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => return None,
            }
        }
    }

    /// Reply to request `id` with `data`.
    pub async fn respond(&mut self, id: i64, data: Value) {
        let frame = json!({"id": id, "type": "response", "data": data});
        self.send_text(&frame.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("send failed");
    }

    pub async fn send_binary(&mut self, data: &[u8]) {
        self.ws
            .send(Message::Binary(data.to_vec().into()))
            .await
            .expect("send failed");
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    /// Wait for the server to close this connection. Returns true if it did.
    pub async fn closed_by_server(&mut self) -> bool {
        let wait = async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.is_ok()
    }

    /// Answer every request with `reply(request)` until the socket closes.
    pub fn spawn_scripted<F>(mut self, reply: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&Value) -> Value + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(request) = self.try_recv_request(Duration::from_secs(30)).await {
                let id = request["id"].as_i64().expect("request without id");
                let data = reply(&request);
                self.respond(id, data).await;
            }
        })
    }
}

//! The two calls the decision layer makes: read the page, act on it.

use std::time::Duration;

use serde_json::{json, Value};

use crate::config::{BridgeConfig, RequestConfig};
use crate::error::BridgeError;
use crate::protocol::{message_type, ResponseData};
use crate::server::BridgeServer;
use crate::state::{self, PageState};

/// A [`BridgeServer`] paired with the configured request deadlines.
pub struct Bridge {
    server: BridgeServer,
    requests: RequestConfig,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            server: BridgeServer::new(config.server),
            requests: config.requests,
        }
    }

    pub fn server(&self) -> &BridgeServer {
        &self.server
    }

    pub async fn start(&self) -> Result<(), BridgeError> {
        self.server.start().await
    }

    pub async fn stop(&self) {
        self.server.stop().await
    }

    /// Wait until an extension is connected and active.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), BridgeError> {
        match self.server.registry().wait_for_active(timeout).await {
            Some(connection) => {
                tracing::debug!(connection = %connection.id(), "extension available");
                Ok(())
            }
            None => Err(BridgeError::NoActiveConnection),
        }
    }

    /// Snapshot the current page, using the configured state timeout.
    pub async fn get_state(&self, include_screenshot: bool) -> Result<PageState, BridgeError> {
        state::get_state(
            self.server.correlator(),
            include_screenshot,
            self.requests.state_timeout(),
        )
        .await
    }

    /// Ask the extension to perform `action` with `params`.
    ///
    /// The response is returned as sent, unknown fields included. An error
    /// reported by the extension comes back as [`BridgeError::Remote`].
    pub async fn execute_action(
        &self,
        action: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<ResponseData, BridgeError> {
        let timeout = timeout.unwrap_or_else(|| self.requests.action_timeout());
        tracing::info!(action, "executing action");
        self.server
            .correlator()
            .send_request(
                message_type::EXECUTE_ACTION,
                Some(json!({ "action": action, "params": params })),
                timeout,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn calls_without_extension_fail_fast() {
        let bridge = Bridge::new(BridgeConfig::default());

        let err = bridge.get_state(false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionUnavailable);

        let err = bridge
            .execute_action("go_back", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoActiveConnection));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_connection_times_out() {
        let bridge = Bridge::new(BridgeConfig::default());
        let err = bridge
            .wait_for_connection(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoActiveConnection));
    }
}

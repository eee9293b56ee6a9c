//! End-to-end exchanges between the bridge and a fake extension over a real
//! WebSocket.

mod common;

use common::{start_bridge, FakeExtension};
use pagelink::{BridgeError, ErrorKind};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn get_state_round_trip() {
    let (bridge, addr) = start_bridge().await;
    let mut ext = FakeExtension::connect_nth(&bridge, addr, 1).await;

    let call = bridge.get_state(true);
    let peer = async {
        let request = ext.recv_request().await;
        assert_eq!(request["type"], "get_state");
        assert_eq!(request["data"], json!({"includeScreenshot": true}));
        let id = request["id"].as_i64().unwrap();
        ext.respond(
            id,
            json!({
                "element_tree": {
                    "type": "element",
                    "tag_name": "div",
                    "children": [{"type": "text", "text": "Hi", "is_visible": true}]
                },
                "selector_map": {"0": {"xpath": "/a"}},
                "url": "https://example.com",
                "title": "Example",
                "tabs": [{"page_id": 1, "url": "https://example.com", "title": "Example"}],
                "screenshot": "aGk=",
                "pixels_below": 640
            }),
        )
        .await;
    };
    let (state, ()) = tokio::join!(call, peer);
    let state = state.unwrap();

    let root = state.element_tree.as_element().unwrap();
    assert_eq!(root.tag_name, "div");
    assert_eq!(root.children.len(), 1);
    assert_eq!(root.children[0].as_text().unwrap().text, "Hi");
    assert_eq!(state.selector_map.get(&0), Some(&json!({"xpath": "/a"})));
    assert_eq!(state.url, "https://example.com");
    assert_eq!(state.tabs.len(), 1);
    assert_eq!(state.tabs[0].page_id, 1);
    assert_eq!(state.screenshot.as_deref(), Some("aGk="));
    assert_eq!(state.pixels_above, 0);
    assert_eq!(state.pixels_below, 640);

    bridge.stop().await;
}

#[tokio::test]
async fn execute_action_returns_open_response() {
    let (bridge, addr) = start_bridge().await;
    let mut ext = FakeExtension::connect_nth(&bridge, addr, 1).await;

    let call = bridge.execute_action("click_element", json!({"index": 4}), None);
    let peer = async {
        let request = ext.recv_request().await;
        assert_eq!(request["type"], "execute_action");
        assert_eq!(
            request["data"],
            json!({"action": "click_element", "params": {"index": 4}})
        );
        let id = request["id"].as_i64().unwrap();
        ext.respond(id, json!({"success": true, "message": "clicked", "navigated": false}))
            .await;
    };
    let (data, ()) = tokio::join!(call, peer);
    let data = data.unwrap();

    assert_eq!(data.success, Some(true));
    assert_eq!(data.message.as_deref(), Some("clicked"));
    assert_eq!(data.extra["navigated"], json!(false));

    bridge.stop().await;
}

#[tokio::test]
async fn extension_errors_are_typed() {
    let (bridge, addr) = start_bridge().await;
    let ext = FakeExtension::connect_nth(&bridge, addr, 1).await;
    let _peer = ext.spawn_scripted(|_| json!({"error": "boom"}));

    let err = bridge
        .execute_action("go_back", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Remote(ref m) if m == "boom"));

    let err = bridge.get_state(false).await.unwrap_err();
    assert!(matches!(err, BridgeError::State(ref m) if m == "boom"));
    assert_eq!(err.kind(), ErrorKind::State);

    bridge.stop().await;
}

#[tokio::test]
async fn concurrent_requests_with_out_of_order_responses() {
    let (bridge, addr) = start_bridge().await;
    let mut ext = FakeExtension::connect_nth(&bridge, addr, 1).await;

    let first = bridge.execute_action("scroll_down", json!({}), None);
    let second = bridge.execute_action("scroll_up", json!({}), None);
    let peer = async {
        let a = ext.recv_request().await;
        let b = ext.recv_request().await;
        // Answer in reverse arrival order, echoing the action name.
        for request in [b, a] {
            let id = request["id"].as_i64().unwrap();
            let action = request["data"]["action"].clone();
            ext.respond(id, json!({"echo": action})).await;
        }
    };
    let (first, second, ()) = tokio::join!(first, second, peer);

    assert_eq!(first.unwrap().extra["echo"], "scroll_down");
    assert_eq!(second.unwrap().extra["echo"], "scroll_up");
    assert!(bridge.server().pending().is_empty());

    bridge.stop().await;
}

#[tokio::test]
async fn junk_frames_do_not_disturb_the_connection() {
    let (bridge, addr) = start_bridge().await;
    let mut ext = FakeExtension::connect_nth(&bridge, addr, 1).await;

    ext.send_text("not json at all").await;
    ext.send_text(r#"{"id": "seven", "type": "response"}"#).await;
    ext.send_text(r#"{"id": 99, "type": "response", "data": {}}"#).await;
    ext.send_text(r#"{"id": 1, "type": "tab_opened", "data": {"tab_id": 3}}"#).await;
    ext.send_binary(&[0xde, 0xad, 0xbe, 0xef]).await;

    let call = bridge.execute_action("wait", json!({"seconds": 1}), None);
    let peer = async {
        let request = ext.recv_request().await;
        let id = request["id"].as_i64().unwrap();
        ext.respond(id, json!({"success": true})).await;
    };
    let (data, ()) = tokio::join!(call, peer);
    assert_eq!(data.unwrap().success, Some(true));
    assert_eq!(bridge.server().registry().len(), 1);

    bridge.stop().await;
}

#[tokio::test]
async fn late_response_after_timeout_is_discarded() {
    let mut config = common::test_config();
    config.requests.action_timeout_secs = 0.2;
    let (bridge, addr) = common::start_bridge_with(config).await;
    let mut ext = FakeExtension::connect_nth(&bridge, addr, 1).await;

    let err = bridge
        .execute_action("go_back", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { .. }));

    let stale = ext.recv_request().await;
    let stale_id = stale["id"].as_i64().unwrap();
    ext.respond(stale_id, json!({"success": true})).await;

    let call = bridge.execute_action("go_forward", json!({}), Some(Duration::from_secs(5)));
    let peer = async {
        let request = ext.recv_request().await;
        let id = request["id"].as_i64().unwrap();
        assert!(id > stale_id);
        ext.respond(id, json!({"message": "fresh"})).await;
    };
    let (data, ()) = tokio::join!(call, peer);
    assert_eq!(data.unwrap().message.as_deref(), Some("fresh"));

    bridge.stop().await;
}

#[tokio::test]
async fn health_reports_connections() {
    let (bridge, addr) = start_bridge().await;
    let _ext = FakeExtension::connect_nth(&bridge, addr, 1).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["pending_requests"], 0);
    assert!(body["active"].as_str().unwrap().starts_with("client_"));

    bridge.stop().await;
}

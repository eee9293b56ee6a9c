//! Page state snapshot: the `get_state` exchange and its assembly into
//! typed structures.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::correlator::RequestCorrelator;
use crate::dom::{self, DomNode};
use crate::error::BridgeError;
use crate::protocol::{message_type, value_as_int, ResponseData};

/// One open browser tab.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabInfo {
    /// `-1` when the extension sent no usable id.
    pub page_id: i64,
    pub url: String,
    pub title: String,
}

impl TabInfo {
    /// Map a raw tab entry. Returns `None` for entries that are not objects.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        let object = raw.as_object()?;
        let page_id = object
            .get("page_id")
            .or_else(|| object.get("id"))
            .and_then(value_as_int)
            .unwrap_or(-1);
        Some(Self {
            page_id,
            url: text_field(object, "url"),
            title: text_field(object, "title"),
        })
    }
}

fn text_field(object: &Map<String, Value>, field: &str) -> String {
    object
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Snapshot of the page the extension is attached to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageState {
    pub element_tree: DomNode,
    /// Highlight index → element descriptor, passed through as sent.
    pub selector_map: BTreeMap<i64, Value>,
    pub url: String,
    pub title: String,
    pub tabs: Vec<TabInfo>,
    /// Base64 screenshot, when one was requested and provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    pub pixels_above: i64,
    pub pixels_below: i64,
}

/// Ask the extension for the current page state.
///
/// Connection, timeout and cancellation errors pass through unchanged; an
/// error reported by the extension becomes [`BridgeError::State`].
pub async fn get_state(
    correlator: &RequestCorrelator,
    include_screenshot: bool,
    timeout: Duration,
) -> Result<PageState, BridgeError> {
    let data = correlator
        .send_request(
            message_type::GET_STATE,
            Some(json!({ "includeScreenshot": include_screenshot })),
            timeout,
        )
        .await
        .map_err(|e| match e {
            BridgeError::Remote(message) => BridgeError::State(message),
            other => other,
        })?;

    assemble(data)
}

/// Build a [`PageState`] from a successful `get_state` response.
pub fn assemble(data: ResponseData) -> Result<PageState, BridgeError> {
    let element_tree = match &data.element_tree {
        Some(raw) => dom::decode(raw),
        None => dom::decode(&Value::Object(Map::new())),
    };

    Ok(PageState {
        element_tree,
        selector_map: selector_map(data.selector_map)?,
        url: data.url.unwrap_or_default(),
        title: data.title.unwrap_or_default(),
        tabs: tabs(data.tabs),
        screenshot: data.screenshot,
        pixels_above: data.pixels_above.unwrap_or(0),
        pixels_below: data.pixels_below.unwrap_or(0),
    })
}

/// Re-key the selector map by integer highlight index. A non-integer key
/// means the extension speaks a different protocol, so it fails the call.
fn selector_map(raw: Option<Value>) -> Result<BTreeMap<i64, Value>, BridgeError> {
    match raw {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(entries)) => entries
            .into_iter()
            .map(|(key, value)| match key.trim().parse::<i64>() {
                Ok(index) => Ok((index, value)),
                Err(_) => Err(BridgeError::StateParse(format!(
                    "selector map key {:?} is not an integer",
                    key
                ))),
            })
            .collect(),
        Some(_) => Err(BridgeError::StateParse(
            "selector map is not an object".to_string(),
        )),
    }
}

fn tabs(raw: Option<Value>) -> Vec<TabInfo> {
    match raw {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .iter()
            .enumerate()
            .filter_map(|(position, entry)| {
                let tab = TabInfo::from_raw(entry);
                if tab.is_none() {
                    tracing::warn!(position, "skipping malformed tab entry");
                }
                tab
            })
            .collect(),
        Some(_) => {
            tracing::warn!("tab list is not an array, ignoring");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::ElementNode;
    use crate::error::ErrorKind;

    fn data(value: Value) -> ResponseData {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn assembles_tree_and_selector_map() {
        let state = assemble(data(json!({
            "element_tree": {
                "type": "element",
                "tag_name": "div",
                "children": [{"type": "text", "text": "Hi", "is_visible": true}]
            },
            "selector_map": {"0": {"xpath": "/a"}}
        })))
        .unwrap();

        let root = state.element_tree.as_element().unwrap();
        assert_eq!(root.tag_name, "div");
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].as_text().unwrap().text, "Hi");

        let mut expected = BTreeMap::new();
        expected.insert(0, json!({"xpath": "/a"}));
        assert_eq!(state.selector_map, expected);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let state = assemble(ResponseData::default()).unwrap();
        assert_eq!(state.element_tree, DomNode::Element(ElementNode::unknown()));
        assert!(state.selector_map.is_empty());
        assert_eq!(state.url, "");
        assert_eq!(state.title, "");
        assert!(state.tabs.is_empty());
        assert_eq!(state.screenshot, None);
        assert_eq!(state.pixels_above, 0);
        assert_eq!(state.pixels_below, 0);
    }

    #[test]
    fn scalar_fields_pass_through() {
        let state = assemble(data(json!({
            "url": "https://example.com/a",
            "title": "Example",
            "screenshot": "iVBORw0KGgo=",
            "pixels_above": 300,
            "pixels_below": 1200
        })))
        .unwrap();
        assert_eq!(state.url, "https://example.com/a");
        assert_eq!(state.title, "Example");
        assert_eq!(state.screenshot.as_deref(), Some("iVBORw0KGgo="));
        assert_eq!(state.pixels_above, 300);
        assert_eq!(state.pixels_below, 1200);
    }

    #[test]
    fn non_integer_selector_key_is_parse_error() {
        let err = assemble(data(json!({"selector_map": {"first": {}}}))).unwrap_err();
        assert!(matches!(err, BridgeError::StateParse(_)));
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(err.to_string().starts_with("could not parse state"));

        let err = assemble(data(json!({"selector_map": [1, 2]}))).unwrap_err();
        assert!(matches!(err, BridgeError::StateParse(_)));
    }

    #[test]
    fn tabs_are_mapped_and_bad_entries_skipped() {
        let state = assemble(data(json!({
            "tabs": [
                {"page_id": 3, "url": "https://a.test", "title": "A"},
                "garbage",
                {"id": "12", "url": "https://b.test"},
                {"page_id": "soon", "title": "C"},
                null
            ]
        })))
        .unwrap();

        assert_eq!(
            state.tabs,
            vec![
                TabInfo { page_id: 3, url: "https://a.test".into(), title: "A".into() },
                TabInfo { page_id: 12, url: "https://b.test".into(), title: String::new() },
                TabInfo { page_id: -1, url: String::new(), title: "C".into() },
            ]
        );
    }

    #[test]
    fn non_array_tabs_are_ignored() {
        let state = assemble(data(json!({"tabs": {"page_id": 1}}))).unwrap();
        assert!(state.tabs.is_empty());
    }

    #[test]
    fn serializes_for_output() {
        let state = assemble(data(json!({
            "url": "https://example.com",
            "selector_map": {"4": {"tag": "a"}}
        })))
        .unwrap();
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["selector_map"]["4"], json!({"tag": "a"}));
        assert_eq!(value["element_tree"]["type"], json!("element"));
        assert!(value.get("screenshot").is_none());
    }
}

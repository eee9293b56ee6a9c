//! Page-element tree decoded from the extension's `element_tree` snapshot.
//!
//! The snapshot is a loosely-typed nested JSON map. [`decode`] turns it into
//! a [`DomNode`] tree and never fails: missing data falls back to defaults,
//! and structurally broken nodes become fallback nodes in place.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::protocol::value_as_int;

/// Nodes nested deeper than this are replaced by the parse-error fallback.
///
/// Decoding recurses once per level; the cap keeps that within a 2 MiB
/// thread stack. Trees that arrive over the wire are already shallower,
/// since serde_json refuses input nested more than 128 levels.
pub const MAX_DEPTH: usize = 128;

/// Tag given to nodes that carried no usable discriminator.
pub const UNKNOWN_TAG: &str = "unknown";
/// Tag given to nodes whose fields had the wrong shape.
pub const PARSE_ERROR_TAG: &str = "parse_error";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomNode {
    Element(ElementNode),
    Text(TextNode),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementNode {
    pub tag_name: String,
    pub attributes: BTreeMap<String, String>,
    /// Handle the extension uses to address this element in later actions.
    pub highlight_index: Option<i64>,
    pub is_visible: bool,
    pub xpath: String,
    pub children: Vec<DomNode>,
    /// Direct text carried on the element itself, alongside any children.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextNode {
    pub text: String,
    pub is_visible: bool,
}

impl ElementNode {
    fn fallback(tag: &str) -> Self {
        Self {
            tag_name: tag.to_string(),
            attributes: BTreeMap::new(),
            highlight_index: None,
            is_visible: false,
            xpath: String::new(),
            children: Vec::new(),
            text: None,
        }
    }

    /// Node standing in for data without a discriminator.
    pub fn unknown() -> Self {
        Self::fallback(UNKNOWN_TAG)
    }

    /// Node standing in for data that could not be interpreted.
    pub fn parse_error() -> Self {
        Self::fallback(PARSE_ERROR_TAG)
    }
}

impl DomNode {
    pub fn is_visible(&self) -> bool {
        match self {
            DomNode::Element(e) => e.is_visible,
            DomNode::Text(t) => t.is_visible,
        }
    }

    pub fn children(&self) -> &[DomNode] {
        match self {
            DomNode::Element(e) => &e.children,
            DomNode::Text(_) => &[],
        }
    }

    pub fn as_element(&self) -> Option<&ElementNode> {
        match self {
            DomNode::Element(e) => Some(e),
            DomNode::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextNode> {
        match self {
            DomNode::Text(t) => Some(t),
            DomNode::Element(_) => None,
        }
    }

    /// Find the element carrying the given highlight index, depth first.
    pub fn find_highlighted(&self, index: i64) -> Option<&ElementNode> {
        let element = self.as_element()?;
        if element.highlight_index == Some(index) {
            return Some(element);
        }
        element
            .children
            .iter()
            .find_map(|child| child.find_highlighted(index))
    }
}

/// A known field was present with the wrong JSON type.
#[derive(Debug)]
struct FieldError {
    field: &'static str,
    expected: &'static str,
}

/// Decode a raw snapshot node. Total over arbitrary input.
pub fn decode(raw: &Value) -> DomNode {
    decode_at(raw, 0)
}

fn decode_at(raw: &Value, depth: usize) -> DomNode {
    if depth > MAX_DEPTH {
        tracing::warn!(depth, "element tree nested too deeply, truncating");
        return DomNode::Element(ElementNode::parse_error());
    }

    let Some(object) = raw.as_object() else {
        return DomNode::Element(ElementNode::unknown());
    };
    let Some(kind) = object.get("type").and_then(Value::as_str) else {
        return DomNode::Element(ElementNode::unknown());
    };

    let decoded = if kind == "text" {
        decode_text(object).map(DomNode::Text)
    } else {
        decode_element(object, depth).map(DomNode::Element)
    };

    decoded.unwrap_or_else(|e| {
        tracing::warn!(
            field = e.field,
            expected = e.expected,
            "malformed element tree node"
        );
        DomNode::Element(ElementNode::parse_error())
    })
}

fn decode_text(object: &Map<String, Value>) -> Result<TextNode, FieldError> {
    Ok(TextNode {
        text: optional_str(object, "text")?.unwrap_or_default(),
        is_visible: optional_bool(object, "is_visible")?.unwrap_or(false),
    })
}

fn decode_element(object: &Map<String, Value>, depth: usize) -> Result<ElementNode, FieldError> {
    let children = match object.get("children") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(raw_children)) => raw_children
            .iter()
            .enumerate()
            .filter_map(|(position, child)| {
                if child.is_object() {
                    Some(decode_at(child, depth + 1))
                } else {
                    tracing::warn!(position, "skipping non-object child in element tree");
                    None
                }
            })
            .collect(),
        Some(_) => {
            return Err(FieldError {
                field: "children",
                expected: "an array",
            })
        }
    };

    let highlight_index = match object.get("highlight_index") {
        None | Some(Value::Null) => None,
        Some(raw) => {
            let index = value_as_int(raw);
            if index.is_none() {
                tracing::warn!(value = %raw, "ignoring non-integer highlight index");
            }
            index
        }
    };

    Ok(ElementNode {
        tag_name: optional_str(object, "tag_name")?.unwrap_or_else(|| UNKNOWN_TAG.to_string()),
        attributes: attributes(object)?,
        highlight_index,
        is_visible: optional_bool(object, "is_visible")?.unwrap_or(false),
        xpath: optional_str(object, "xpath")?.unwrap_or_default(),
        children,
        text: optional_str(object, "text")?,
    })
}

fn attributes(object: &Map<String, Value>) -> Result<BTreeMap<String, String>, FieldError> {
    match object.get("attributes") {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => Ok(map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()),
        Some(_) => Err(FieldError {
            field: "attributes",
            expected: "an object",
        }),
    }
}

fn optional_str(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, FieldError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(FieldError {
            field,
            expected: "a string",
        }),
    }
}

fn optional_bool(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<bool>, FieldError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(FieldError {
            field,
            expected: "a boolean",
        }),
    }
}

//! JSON envelope protocol spoken with the browser extension.
//!
//! Wire format: one JSON object per WebSocket text frame,
//! `{"id": <int>, "type": <string>, "data": <optional value>}`.
//!
//! Requests flow server → extension; the extension answers each one with a
//! `"response"` frame echoing the request id.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Request identifier. Allocated by the server, echoed back by the peer.
pub type RequestId = i64;

/// Message `type` values understood by the server.
pub mod message_type {
    /// Outbound: snapshot the current page.
    pub const GET_STATE: &str = "get_state";
    /// Outbound: perform one action on the page.
    pub const EXECUTE_ACTION: &str = "execute_action";
    /// Inbound: answer to a previously issued request.
    pub const RESPONSE: &str = "response";
}

/// A frame that could not be decoded into an envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("expected a response frame, got `{0}`")]
    UnexpectedType(String),
}

/// Structurally valid frame: an integer id, a string type, optional data.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: RequestId,
    pub message_type: String,
    pub data: Option<Value>,
}

/// Frame of type `"response"` whose data decoded as [`ResponseData`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub id: RequestId,
    pub data: ResponseData,
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    id: RequestId,
    #[serde(rename = "type")]
    message_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
}

/// Payload of a response frame.
///
/// Known fields are typed; everything else lands in `extra` and is
/// serialized back out untouched. Numeric and text fields are read
/// leniently: a value of the wrong shape reads as absent instead of
/// rejecting the whole response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_tree: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector_map: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tabs: Option<Value>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, deserialize_with = "lenient_int", skip_serializing_if = "Option::is_none")]
    pub pixels_above: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int", skip_serializing_if = "Option::is_none")]
    pub pixels_below: Option<i64>,
    /// Content extracted from the page by an action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    /// Free-form note from the extension.
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "lenient_int", skip_serializing_if = "Option::is_none")]
    pub new_tab_id: Option<i64>,
    /// Tab that became active.
    #[serde(default, deserialize_with = "lenient_int", skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int", skip_serializing_if = "Option::is_none")]
    pub closed_tab_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseData {
    /// The remote error text, if the peer reported a non-empty one.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }
}

/// Decode a frame into its envelope, validating `id` and `type`.
pub fn decode_envelope(raw: &str) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let id = match object.get("id") {
        None | Some(Value::Null) => return Err(ProtocolError::MissingField("id")),
        Some(v) => v.as_i64().ok_or(ProtocolError::InvalidField {
            field: "id",
            expected: "an integer",
        })?,
    };

    let message_type = match object.remove("type") {
        None | Some(Value::Null) => return Err(ProtocolError::MissingField("type")),
        Some(Value::String(s)) => s,
        Some(_) => {
            return Err(ProtocolError::InvalidField {
                field: "type",
                expected: "a string",
            })
        }
    };

    let data = object.remove("data").filter(|v| !v.is_null());

    Ok(Envelope {
        id,
        message_type,
        data,
    })
}

/// Decode a `"response"` frame, including its open-schema data object.
pub fn decode_response(raw: &str) -> Result<ResponseEnvelope, ProtocolError> {
    response_from_envelope(decode_envelope(raw)?)
}

/// Finish decoding an already-validated envelope as a response.
pub fn response_from_envelope(envelope: Envelope) -> Result<ResponseEnvelope, ProtocolError> {
    if envelope.message_type != message_type::RESPONSE {
        return Err(ProtocolError::UnexpectedType(envelope.message_type));
    }
    let data = match envelope.data {
        None => return Err(ProtocolError::MissingField("data")),
        Some(data @ Value::Object(_)) => serde_json::from_value(data)?,
        Some(_) => {
            return Err(ProtocolError::InvalidField {
                field: "data",
                expected: "an object",
            })
        }
    };
    Ok(ResponseEnvelope {
        id: envelope.id,
        data,
    })
}

/// Encode an outbound request. `data` is left off the wire when `None`.
pub fn encode_request(
    id: RequestId,
    message_type: &str,
    data: Option<&Value>,
) -> Result<String, ProtocolError> {
    let envelope = RequestEnvelope {
        id,
        message_type,
        data,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Read an integer out of a loosely-typed value: integers, integral floats
/// and numeric strings are accepted.
pub(crate) fn value_as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_int))
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_bool()))
}

fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

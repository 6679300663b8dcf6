//! Wire envelopes.
//!
//! Every frame carries exactly one envelope: a request, a response, or
//! a notification. The wire shape is the JSON-RPC 2.0 layout; a
//! "simple" style that omits the `jsonrpc` tag is accepted
//! interchangeably on decode and selectable on encode. Envelopes encode
//! to [`Value`] so any codec can carry them.

use std::collections::BTreeMap;

use tether_core::error::{Error, Result};
use tether_core::value::Value;

/// JSON-RPC numeric error codes used by the framework.
pub mod codes {
    /// Payload could not be parsed as an envelope
    pub const PARSE_ERROR: i64 = -32700;
    /// Envelope was structurally invalid
    pub const INVALID_REQUEST: i64 = -32600;
    /// No handler registered for the method
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Params failed the handler's validation
    pub const INVALID_PARAMS: i64 = -32602;
    /// Framework-side failure while dispatching
    pub const INTERNAL_ERROR: i64 = -32603;
    /// A handler returned or threw an application error
    pub const HANDLER_ERROR: i64 = -32000;
}

const JSONRPC_TAG: &str = "2.0";

/// Which layout `encode` emits. Decoding accepts either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireStyle {
    /// `{"jsonrpc":"2.0", ...}`
    JsonRpc,
    /// Same fields without the version tag
    #[default]
    Simple,
}

/// Error object inside a response.
#[derive(Debug, Clone, PartialEq)]
pub struct WireError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl WireError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Self::Protocol {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: u64,
        method: String,
        params: Value,
    },
    Response {
        id: u64,
        result: std::result::Result<Value, WireError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Envelope {
    /// Encode into a [`Value`] ready for the codec.
    #[must_use]
    pub fn to_value(&self, style: WireStyle) -> Value {
        let mut map = BTreeMap::new();
        if style == WireStyle::JsonRpc {
            map.insert("jsonrpc".to_string(), Value::from(JSONRPC_TAG));
        }
        match self {
            Self::Request { id, method, params } => {
                map.insert("id".to_string(), Value::Int(*id as i64));
                map.insert("method".to_string(), Value::from(method.as_str()));
                map.insert("params".to_string(), params.clone());
            }
            Self::Response { id, result } => {
                map.insert("id".to_string(), Value::Int(*id as i64));
                match result {
                    Ok(value) => {
                        map.insert("result".to_string(), value.clone());
                    }
                    Err(err) => {
                        let mut obj = BTreeMap::new();
                        obj.insert("code".to_string(), Value::Int(err.code));
                        obj.insert("message".to_string(), Value::from(err.message.as_str()));
                        if let Some(data) = &err.data {
                            obj.insert("data".to_string(), data.clone());
                        }
                        map.insert("error".to_string(), Value::Map(obj));
                    }
                }
            }
            Self::Notification { method, params } => {
                map.insert("method".to_string(), Value::from(method.as_str()));
                map.insert("params".to_string(), params.clone());
            }
        }
        Value::Map(map)
    }

    /// Decode from a codec-produced [`Value`].
    ///
    /// Classification follows the field shape: an `id` plus `method` is
    /// a request, an `id` plus `result`/`error` is a response, a bare
    /// `method` is a notification.
    pub fn from_value(value: Value) -> Result<Self> {
        let map = match value {
            Value::Map(map) => map,
            other => {
                return Err(Error::protocol(
                    codes::INVALID_REQUEST,
                    format!("envelope must be a map, got {other}"),
                ))
            }
        };

        let id = match map.get("id") {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_i64().filter(|n| *n >= 0).ok_or_else(|| {
                Error::protocol(codes::INVALID_REQUEST, "id must be a non-negative integer")
            })? as u64),
        };
        let method = match map.get("method") {
            None => None,
            Some(Value::Str(s)) => Some(s.clone()),
            Some(_) => {
                return Err(Error::protocol(
                    codes::INVALID_REQUEST,
                    "method must be a string",
                ))
            }
        };
        let params = map.get("params").cloned().unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => Ok(Self::Request { id, method, params }),
            (None, Some(method)) => Ok(Self::Notification { method, params }),
            (Some(id), None) => {
                let has_result = map.contains_key("result");
                let error = map.get("error");
                match (has_result, error) {
                    (true, None) => Ok(Self::Response {
                        id,
                        result: Ok(map.get("result").cloned().unwrap_or(Value::Null)),
                    }),
                    (false, Some(err)) => Ok(Self::Response {
                        id,
                        result: Err(decode_error(err)?),
                    }),
                    (true, Some(_)) => Err(Error::protocol(
                        codes::INVALID_REQUEST,
                        "response carries both result and error",
                    )),
                    (false, None) => Err(Error::protocol(
                        codes::INVALID_REQUEST,
                        "response carries neither result nor error",
                    )),
                }
            }
            (None, None) => Err(Error::protocol(
                codes::INVALID_REQUEST,
                "envelope has neither method nor id",
            )),
        }
    }
}

fn decode_error(value: &Value) -> Result<WireError> {
    let map = value.as_map().ok_or_else(|| {
        Error::protocol(codes::INVALID_REQUEST, "error object must be a map")
    })?;
    let code = map
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::protocol(codes::INVALID_REQUEST, "error code must be an integer"))?;
    let message = map
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Ok(WireError {
        code,
        message,
        data: map.get("data").cloned(),
    })
}

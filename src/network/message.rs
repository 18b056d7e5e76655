//! RPC message shapes carried inside CBOR frames.
//!
//! Every frame is a CBOR map. Which keys are present decides the kind:
//! `error` wins over `result`, which wins over `method`. Anything that does
//! not fit one of the four shapes is an Invalid Request.

use crate::constants::rpc::{INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};
use crate::network::connection::RemoteAddr;
use ciborium::Value;

/// The `id` field of an inbound method frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallId {
    /// No id: a notification
    Absent,
    Int(i64),
    /// Present but not an integer
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse Error")
    }

    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method Not Found")
    }

    fn to_value(&self) -> Value {
        let mut entries = vec![
            (text("code"), Value::Integer(self.code.into())),
            (text("message"), Value::Text(self.message.clone())),
        ];
        if let Some(data) = &self.data {
            entries.push((text("data"), data.clone()));
        }
        Value::Map(entries)
    }

    fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_map()?;
        let code = lookup(map, "code").and_then(as_i64)?;
        let message = lookup(map, "message")?.as_text()?.to_string();
        Some(Self {
            code,
            message,
            data: lookup(map, "data").cloned(),
        })
    }
}

/// A well-formed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// Request or notification, depending on `id`
    Call {
        method: String,
        params: Vec<Value>,
        id: CallId,
    },
    Result {
        result: Value,
        id: i64,
    },
    Error {
        error: ErrorObject,
        id: i64,
    },
    /// Error frame without an integer id: the peer gave up on us
    PeerBreak {
        error: Option<ErrorObject>,
    },
}

impl RpcMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            RpcMessage::Call {
                id: CallId::Absent, ..
            } => "Notification",
            RpcMessage::Call { .. } => "Request",
            RpcMessage::Result { .. } => "Result",
            RpcMessage::Error { .. } => "Error",
            RpcMessage::PeerBreak { .. } => "PeerBreak",
        }
    }
}

/// Classify a decoded frame. `Err` carries the protocol error to report.
pub fn classify(value: Value) -> Result<RpcMessage, ErrorObject> {
    let Value::Map(map) = value else {
        return Err(ErrorObject::invalid_request());
    };
    let has = |key: &str| lookup(&map, key).is_some();
    let id = lookup(&map, "id");

    if let Some(error) = lookup(&map, "error") {
        let Some(id) = id.and_then(as_i64) else {
            return Ok(RpcMessage::PeerBreak {
                error: ErrorObject::from_value(error),
            });
        };
        if has("result") || has("method") {
            return Err(ErrorObject::invalid_request());
        }
        let error = ErrorObject::from_value(error).ok_or_else(ErrorObject::invalid_request)?;
        return Ok(RpcMessage::Error { error, id });
    }

    if let Some(result) = lookup(&map, "result") {
        if has("method") {
            return Err(ErrorObject::invalid_request());
        }
        let id = id.and_then(as_i64).ok_or_else(ErrorObject::invalid_request)?;
        return Ok(RpcMessage::Result {
            result: result.clone(),
            id,
        });
    }

    if let Some(method) = lookup(&map, "method") {
        let method = method
            .as_text()
            .ok_or_else(ErrorObject::invalid_request)?
            .to_string();
        let params = lookup(&map, "params")
            .and_then(Value::as_array)
            .ok_or_else(ErrorObject::invalid_request)?
            .clone();
        let id = match id {
            None => CallId::Absent,
            Some(v) => as_i64(v).map_or(CallId::Invalid, CallId::Int),
        };
        return Ok(RpcMessage::Call { method, params, id });
    }

    Err(ErrorObject::invalid_request())
}

pub fn request(method: &str, params: Vec<Value>, id: i64) -> Value {
    Value::Map(vec![
        (text("method"), Value::Text(method.to_string())),
        (text("params"), Value::Array(params)),
        (text("id"), Value::Integer(id.into())),
    ])
}

pub fn notification(method: &str, params: Vec<Value>) -> Value {
    Value::Map(vec![
        (text("method"), Value::Text(method.to_string())),
        (text("params"), Value::Array(params)),
    ])
}

pub fn result(result: Value, id: i64) -> Value {
    Value::Map(vec![
        (text("result"), result),
        (text("id"), Value::Integer(id.into())),
    ])
}

/// Error frame; `id` is omitted for protocol errors
pub fn error(error: &ErrorObject, id: Option<i64>) -> Value {
    let mut entries = vec![(text("error"), error.to_value())];
    if let Some(id) = id {
        entries.push((text("id"), Value::Integer(id.into())));
    }
    Value::Map(entries)
}

/// Address payload of `whoami` and `peers`: `{address, port, incoming?}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub addr: RemoteAddr,
    pub incoming: Option<bool>,
}

impl PeerAddr {
    pub fn to_value(&self) -> Value {
        let mut entries = vec![
            (text("address"), Value::Bytes(self.addr.address_bytes())),
            (text("port"), Value::Integer(self.addr.port.into())),
        ];
        if let Some(incoming) = self.incoming {
            entries.push((text("incoming"), Value::Bool(incoming)));
        }
        Value::Map(entries)
    }

    /// `None` for anything that is not a usable address
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_map()?;
        let address = lookup(map, "address")?.as_bytes()?;
        let port = lookup(map, "port")
            .and_then(as_i64)
            .and_then(|p| u16::try_from(p).ok())?;
        let incoming = lookup(map, "incoming").and_then(Value::as_bool);
        Some(Self {
            addr: RemoteAddr::from_bytes(address, port)?,
            incoming,
        })
    }
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn lookup<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

fn as_i64(value: &Value) -> Option<i64> {
    value.as_integer().and_then(|i| i64::try_from(i).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (text(k), v)).collect())
    }

    #[test]
    fn test_request_and_notification_ids() {
        let msg = classify(request("peers", vec![], 3)).unwrap();
        assert_eq!(msg.message_type(), "Request");
        assert!(matches!(msg, RpcMessage::Call { id: CallId::Int(3), .. }));

        let msg = classify(notification("peers", vec![])).unwrap();
        assert!(matches!(msg, RpcMessage::Call { id: CallId::Absent, .. }));

        let msg = classify(map(vec![
            ("method", text("peers")),
            ("params", Value::Array(vec![])),
            ("id", text("x")),
        ]))
        .unwrap();
        assert!(matches!(msg, RpcMessage::Call { id: CallId::Invalid, .. }));
    }

    #[test]
    fn test_invalid_shapes() {
        let bad = [
            Value::Integer(1.into()),
            map(vec![("nothing", Value::Null)]),
            map(vec![("method", Value::Integer(1.into())), ("params", Value::Array(vec![]))]),
            map(vec![("method", text("peers"))]),
            map(vec![("method", text("peers")), ("params", Value::Null)]),
            map(vec![("result", Value::Null)]),
            map(vec![("result", Value::Null), ("method", text("a")), ("id", Value::Integer(1.into()))]),
            map(vec![("error", Value::Null), ("id", Value::Integer(1.into()))]),
        ];
        for value in bad {
            assert_eq!(
                classify(value.clone()).unwrap_err().code,
                INVALID_REQUEST,
                "{:?}",
                value
            );
        }
    }

    #[test]
    fn test_error_without_integer_id_is_peer_break() {
        let frame = error(&ErrorObject::parse_error(), None);
        match classify(frame).unwrap() {
            RpcMessage::PeerBreak { error: Some(e) } => assert_eq!(e.code, PARSE_ERROR),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_reply_keeps_data() {
        let mut obj = ErrorObject::new(-32000, "boom");
        obj.data = Some(text("detail"));
        match classify(error(&obj, Some(9))).unwrap() {
            RpcMessage::Error { error, id } => {
                assert_eq!(id, 9);
                assert_eq!(error, obj);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_peer_addr_payload() {
        let addr = RemoteAddr::new("2a01::1".parse().unwrap(), 4000);
        let payload = PeerAddr {
            addr,
            incoming: Some(true),
        };
        assert_eq!(PeerAddr::from_value(&payload.to_value()), Some(payload));

        let bad_len = map(vec![
            ("address", Value::Bytes(vec![1, 2, 3])),
            ("port", Value::Integer(1.into())),
        ]);
        assert!(PeerAddr::from_value(&bad_len).is_none());
        let bad_port = map(vec![
            ("address", Value::Bytes(vec![1, 2, 3, 4])),
            ("port", Value::Integer(70000.into())),
        ]);
        assert!(PeerAddr::from_value(&bad_port).is_none());
    }
}

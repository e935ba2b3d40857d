//! Wire seam to the remote region engine.
//!
//! Every remote procedure returns a two-element reply `[status, payload]`
//! with `status` either `"okay"` or `"error"`. The transport carries that
//! shape verbatim; interpreting the payload is the gateway's job.
//!
//! - `http`: JSON-over-HTTP client for real engines
//! - `mock`: programmable in-memory engine for tests

use async_trait::async_trait;
use serde_json::Value;

pub mod http;
pub mod mock;

pub use http::HttpTransport;
pub use mock::MockEngine;

/// Errors reaching or decoding replies from the engine.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("engine call failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed engine reply: {0}")]
    MalformedReply(String),
}

/// Engine-level reply status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyStatus {
    Okay,
    Error,
}

/// The engine's two-element reply.
#[derive(Clone, Debug)]
pub struct RpcReply {
    pub status: ReplyStatus,
    pub payload: Value,
}

impl RpcReply {
    pub fn okay(payload: Value) -> Self {
        Self {
            status: ReplyStatus::Okay,
            payload,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            payload: Value::String(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ReplyStatus::Error
    }

    /// Decode a reply from the raw `[status, payload]` array.
    pub fn from_value(value: Value) -> Result<Self, TransportError> {
        let items = match value {
            Value::Array(items) if items.len() == 2 => items,
            other => {
                return Err(TransportError::MalformedReply(format!(
                    "expected [status, payload], got {other}"
                )))
            }
        };
        let mut items = items.into_iter();
        let status = match items.next().and_then(|s| s.as_str().map(str::to_string)) {
            Some(s) if s == "okay" => ReplyStatus::Okay,
            Some(s) if s == "error" => ReplyStatus::Error,
            Some(s) => {
                return Err(TransportError::MalformedReply(format!(
                    "unknown reply status '{s}'"
                )))
            }
            None => {
                return Err(TransportError::MalformedReply(
                    "non-string reply status".to_string(),
                ))
            }
        };
        let payload = items.next().unwrap_or(Value::Null);
        Ok(Self { status, payload })
    }
}

/// Interface for dispatching one remote procedure call.
///
/// Implementations:
/// - `HttpTransport`: JSON POST against a live engine
/// - `MockEngine`: in-memory engine for testing
#[async_trait]
pub trait EngineTransport: Send + Sync {
    /// Dispatch `method` with positional `params` and return the raw reply.
    async fn call(&self, method: &str, params: &[Value]) -> Result<RpcReply, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_two_element_replies() {
        let reply = RpcReply::from_value(json!(["okay", "q1"])).unwrap();
        assert_eq!(reply.status, ReplyStatus::Okay);
        assert_eq!(reply.payload, json!("q1"));

        let reply = RpcReply::from_value(json!(["error", "bad query"])).unwrap();
        assert!(reply.is_error());
    }

    #[test]
    fn rejects_malformed_replies() {
        assert!(RpcReply::from_value(json!("okay")).is_err());
        assert!(RpcReply::from_value(json!(["okay"])).is_err());
        assert!(RpcReply::from_value(json!(["done", 1])).is_err());
        assert!(RpcReply::from_value(json!([1, 2])).is_err());
    }
}

//! HTTP transport for live engines.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{EngineTransport, RpcReply, TransportError};

/// JSON-over-HTTP transport: each call is a POST of
/// `{"method": ..., "params": [...]}` to the engine endpoint, answered
/// with the `[status, payload]` array.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl EngineTransport for HttpTransport {
    async fn call(&self, method: &str, params: &[Value]) -> Result<RpcReply, TransportError> {
        let body = json!({
            "method": method,
            "params": params,
        });
        let reply: Value = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        RpcReply::from_value(reply)
    }
}

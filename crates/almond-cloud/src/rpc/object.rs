//! Locally published objects.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::channel::RpcChannel;
use super::error::RpcError;

/// An object the peer may call into.
///
/// `invoke` is only reached for names listed by `methods`; the channel
/// answers anything else with [`RpcError::MethodNotFound`].
#[async_trait]
pub trait RpcObject: Send + Sync + 'static {
    /// Method names exposed to the peer.
    fn methods(&self) -> &'static [&'static str];

    /// Handle one call. `channel` is the channel the call arrived on, for
    /// turning references found in `args` into proxies.
    async fn invoke(
        &self,
        channel: &Arc<RpcChannel>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError>;
}

/// Decode positional argument `index`. A missing argument decodes from
/// `null`, so optional parameters can be `Option<T>`.
pub fn arg<T: DeserializeOwned>(method: &str, args: &[Value], index: usize) -> Result<T, RpcError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| RpcError::invalid_arguments(method, format!("argument {index}: {e}")))
}

/// Encode a method's return value.
pub fn to_result<T: serde::Serialize>(method: &str, value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value)
        .map_err(|e| RpcError::Protocol(format!("cannot encode result of {method}: {e}")))
}

use serde::Serialize;
use serde_json::Value;

use super::error::RpcError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Outgoing JSON-RPC 2.0 request.
///
/// `params` is omitted from the wire form when the caller has none.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<&'a Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<&'a Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: id.to_string(),
            method,
            params: params.filter(|p| !p.is_null()),
        }
    }
}

/// Splits a decoded response body into its result or its error.
///
/// A non-null `error` member wins over everything else. A body with neither
/// `result` nor `error` is returned whole, which is what the REST-style
/// endpoints and some lenient nodes produce.
pub fn into_rpc_result(body: Value) -> Result<Value, RpcError> {
    match body {
        Value::Object(mut map) => {
            if let Some(error) = map.get("error").filter(|e| !e.is_null()) {
                return Err(RpcError::from_value(error));
            }
            match map.remove("result") {
                Some(result) => Ok(result),
                None => Ok(Value::Object(map)),
            }
        },
        other => Ok(other),
    }
}

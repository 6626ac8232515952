use serde_json::Value;

use crate::error::{HibernatorError, Result};
use crate::rpc::JsonRpcRequest;

/// Inspects a proxied request body and extracts the privacy-manager public
/// keys of a private transaction's participants.
///
/// Returns `None` for public transactions and for anything that is not a
/// transaction submission. Returns a decode error for bodies that are not
/// JSON at all; the caller forwards those unchanged.
pub fn is_private_tx(body: &[u8]) -> Result<Option<Vec<String>>> {
    let req: JsonRpcRequest =
        serde_json::from_slice(body).map_err(|e| HibernatorError::Decode(e.to_string()))?;

    if req.method != "eth_sendTransaction" && req.method != "eth_sendRawPrivateTransaction" {
        return Ok(None);
    }

    let Some(Value::Array(params)) = req.params else {
        return Ok(None);
    };
    for param in &params {
        if let Some(Value::Array(keys)) = param.get("privateFor") {
            let keys: Vec<String> = keys
                .iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect();
            if !keys.is_empty() {
                return Ok(Some(keys));
            }
        }
    }
    Ok(None)
}

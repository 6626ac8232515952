use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::ClientTls;
use crate::error::{HibernatorError, Result};
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON-RPC / REST client over HTTP. One instance is built per TLS
/// configuration at startup and shared by everything talking to that
/// endpoint; the underlying connection pool is reused across calls.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
}

impl RpcClient {
    pub fn new(tls: Option<&ClientTls>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);

        if let Some(tls) = tls {
            for cert in tls.root_certificates()? {
                builder = builder.add_root_certificate(cert);
            }
            if let Some(identity) = tls.identity()? {
                builder = builder.identity(identity);
            }
            if tls.insecure_skip_verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        let http = builder
            .build()
            .map_err(|e| HibernatorError::config(format!("building http client: {e}")))?;
        Ok(Self { http })
    }

    /// Calls a JSON-RPC method and decodes the `result` field into `T`.
    ///
    /// A non-200 response is a transport error, a JSON-RPC `error` object is
    /// surfaced as `HibernatorError::Rpc`, and a missing or mistyped result
    /// is a decode error.
    pub async fn call_rpc<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<T> {
        let req = JsonRpcRequest::new(method, params);
        let resp = self.post_rpc(url, &req).await?;

        if let Some(err) = resp.error {
            return Err(HibernatorError::Rpc {
                code: err.code,
                message: err.message,
                data: err.data.unwrap_or(Value::Null),
            });
        }
        let result = resp
            .result
            .ok_or_else(|| HibernatorError::Decode(format!("{method}: response has no result")))?;
        serde_json::from_value(result)
            .map_err(|e| HibernatorError::Decode(format!("{method}: {e}")))
    }

    /// Posts a raw JSON-RPC body and returns the undecoded envelope. Used by
    /// up-checks whose request body comes verbatim from configuration.
    pub async fn call_raw_rpc(&self, url: &str, body: &str) -> Result<JsonRpcResponse> {
        debug!("rpc call to {} body {}", url, body);
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| HibernatorError::transport(url, e))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(HibernatorError::transport(
                url,
                format!("response status failed, not OK, status={status}"),
            ));
        }
        let raw = resp
            .bytes()
            .await
            .map_err(|e| HibernatorError::transport(url, e))?;
        serde_json::from_slice(&raw).map_err(|e| HibernatorError::Decode(e.to_string()))
    }

    /// Makes a plain HTTP request and returns the raw response body. Only a
    /// 200 response is a success.
    pub async fn call_rest(&self, url: &str, method: &str, body: &str) -> Result<String> {
        let method: reqwest::Method = method
            .parse()
            .map_err(|_| HibernatorError::config(format!("invalid http method {method}")))?;
        let mut req = self.http.request(method, url);
        if !body.is_empty() {
            req = req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| HibernatorError::transport(url, e))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(HibernatorError::transport(
                url,
                format!("response status failed, not OK, status={status}"),
            ));
        }
        resp.text()
            .await
            .map_err(|e| HibernatorError::transport(url, e))
    }

    async fn post_rpc(&self, url: &str, req: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        debug!("rpc call to {} method {}", url, req.method);
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(req)
            .send()
            .await
            .map_err(|e| HibernatorError::transport(url, e))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(HibernatorError::transport(
                url,
                format!("response status failed, not OK, status={status}"),
            ));
        }
        resp.json()
            .await
            .map_err(|e| HibernatorError::Decode(e.to_string()))
    }

    /// The underlying HTTP client, for components that forward raw traffic.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

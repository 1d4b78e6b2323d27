//! HTTP JSON-RPC log source backed by `reqwest`.
//!
//! New heads are discovered by polling `eth_blockNumber`; the stream only
//! yields when the head moves forward.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use marketindex_core::error::IndexerError;
use marketindex_core::types::{BlockSummary, RawLog};

use crate::source::{hex_quantity, parse_hex_u64, BlockStream, LogSource, RpcBlock, RpcLog};

/// Node-side code for "limit exceeded" (range too large, too many results).
const LIMIT_EXCEEDED: i64 = -32005;

/// Configuration for [`HttpLogSource`].
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub request_timeout: Duration,
    /// Interval between `eth_blockNumber` polls for the new-block stream.
    pub poll_interval: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Transport-level failures, classified before they reach the pipeline.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Response(String),
}

impl RpcError {
    /// Returns `true` if retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Rpc { code, message } => {
                let message = message.to_ascii_lowercase();
                *code == LIMIT_EXCEEDED
                    || message.contains("rate limit")
                    || message.contains("too many")
                    || message.contains("timeout")
                    || message.contains("header not found")
            }
            Self::Response(_) => false,
        }
    }
}

impl From<RpcError> for IndexerError {
    fn from(e: RpcError) -> Self {
        if e.is_retryable() {
            IndexerError::TransientSource(e.to_string())
        } else {
            IndexerError::Source(e.to_string())
        }
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RpcError::Timeout
        } else if e.is_decode() {
            RpcError::Response(e.to_string())
        } else {
            RpcError::Http(e.to_string())
        }
    }
}

struct Inner {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    poll_interval: Duration,
}

impl Inner {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let req = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let resp = self.http.post(&self.url).json(&req).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RpcError::Status { status, body });
        }

        let body: RpcResponse = resp.json().await?;
        if let Some(err) = body.error {
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn block_number(&self) -> Result<u64, IndexerError> {
        let value = self.call("eth_blockNumber", json!([])).await?;
        let hex = value
            .as_str()
            .ok_or_else(|| RpcError::Response(format!("eth_blockNumber returned {value}")))?;
        parse_hex_u64(hex)
    }
}

/// JSON-RPC over HTTP [`LogSource`].
#[derive(Clone)]
pub struct HttpLogSource {
    inner: Arc<Inner>,
}

impl HttpLogSource {
    pub fn new(url: impl Into<String>, config: HttpSourceConfig) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IndexerError::Config(format!("http client: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                url: url.into(),
                http,
                next_id: AtomicU64::new(1),
                poll_interval: config.poll_interval,
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }
}

#[async_trait]
impl LogSource for HttpLogSource {
    async fn head_block_number(&self) -> Result<u64, IndexerError> {
        self.inner.block_number().await
    }

    async fn block(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
        let value = self
            .inner
            .call("eth_getBlockByNumber", json!([hex_quantity(number), false]))
            .await?;
        if value.is_null() {
            return Ok(None);
        }
        let block: RpcBlock =
            serde_json::from_value(value).map_err(|e| RpcError::Response(format!("block {number}: {e}")))?;
        block.into_summary().map(Some)
    }

    async fn get_logs(&self, address: &str, topic0: &str, from: u64, to: u64) -> Result<Vec<RawLog>, IndexerError> {
        let filter = json!([{
            "address": address,
            "topics": [topic0],
            "fromBlock": hex_quantity(from),
            "toBlock": hex_quantity(to),
        }]);
        let value = self.inner.call("eth_getLogs", filter).await?;
        let logs: Vec<RpcLog> =
            serde_json::from_value(value).map_err(|e| RpcError::Response(format!("eth_getLogs: {e}")))?;
        tracing::debug!(from, to, topic0, count = logs.len(), "eth_getLogs");
        logs.into_iter().map(RpcLog::into_raw).collect()
    }

    async fn subscribe_new_blocks(&self) -> Result<BlockStream, IndexerError> {
        let inner = self.inner.clone();
        let heads = stream::unfold((inner, None::<u64>), |(inner, last)| async move {
            loop {
                tokio::time::sleep(inner.poll_interval).await;
                match inner.block_number().await {
                    Ok(head) if last.map_or(true, |l| head > l) => return Some((head, (inner, Some(head)))),
                    Ok(_) => continue,
                    Err(e) => tracing::warn!(error = %e, url = %inner.url, "head poll failed"),
                }
            }
        });
        Ok(Box::pin(heads))
    }
}

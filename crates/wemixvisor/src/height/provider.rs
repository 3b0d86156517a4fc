use std::time::Duration;

use async_trait::async_trait;
use eyre::{
    bail,
    WrapErr as _,
};
use serde::Deserialize;
use serde_json::json;

/// Capability to ask the node for its latest committed block height.
///
/// Implementations may fail transiently; callers treat any error as
/// "unknown height, retry later". Must be safe to call concurrently.
#[async_trait]
pub trait HeightProvider: Send + Sync {
    async fn current_height(&self) -> eyre::Result<u64>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Production binding querying the node's JSON-RPC endpoint with
/// `eth_blockNumber` and decoding the hex quantity it returns.
pub struct RpcHeightProvider {
    client: reqwest::Client,
    url: String,
}

impl RpcHeightProvider {
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(url: &str) -> eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .wrap_err("failed constructing http client for height queries")?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[async_trait]
impl HeightProvider for RpcHeightProvider {
    async fn current_height(&self) -> eyre::Result<u64> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_blockNumber",
            "params": [],
        });
        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .wrap_err("height request failed")?
            .error_for_status()
            .wrap_err("height request returned an error status")?
            .json()
            .await
            .wrap_err("failed decoding height response")?;
        if let Some(error) = response.error {
            bail!("node rpc returned error {}: {}", error.code, error.message);
        }
        let Some(quantity) = response.result else {
            bail!("height response carried neither result nor error");
        };
        parse_hex_quantity(&quantity)
    }
}

fn parse_hex_quantity(quantity: &str) -> eyre::Result<u64> {
    let digits = quantity
        .strip_prefix("0x")
        .or_else(|| quantity.strip_prefix("0X"))
        .unwrap_or(quantity);
    u64::from_str_radix(digits, 16)
        .wrap_err_with(|| format!("`{quantity}` is not a valid hex block number"))
}

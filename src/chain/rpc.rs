//! Thin JSON-RPC client for read-only chain access.
//!
//! Every request carries the client-level timeout; callers treat a
//! timeout as that call's normal failure path. Writes never happen here.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

/// Block reference for historical reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Latest,
    Number(u64),
}

impl BlockRef {
    fn to_tag(self) -> String {
        match self {
            BlockRef::Latest => "latest".to_string(),
            BlockRef::Number(n) => format!("0x{n:x}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
}

impl LogEntry {
    pub fn block_number_u64(&self) -> Option<u64> {
        parse_quantity(&self.block_number).ok()
    }
}

fn parse_quantity(hex_value: &str) -> Result<u64> {
    u64::from_str_radix(hex_value.trim_start_matches("0x"), 16)
        .with_context(|| format!("invalid hex quantity: {hex_value}"))
}

pub struct RpcClient {
    client: Client,
    url: String,
}

impl RpcClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, url })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response: JsonRpcResponse = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("RPC request failed: {method}"))?
            .json()
            .await
            .with_context(|| format!("failed to parse RPC response: {method}"))?;

        if let Some(err) = response.error {
            return Err(anyhow!("RPC error in {method}: {err}"));
        }
        response
            .result
            .ok_or_else(|| anyhow!("no result in RPC response: {method}"))
    }

    /// Execute a read-only contract call and return the raw result bytes.
    pub async fn call(&self, to: &str, data: &[u8], block: BlockRef) -> Result<Vec<u8>> {
        let result = self
            .request(
                "eth_call",
                json!([{ "to": to, "data": format!("0x{}", hex::encode(data)) }, block.to_tag()]),
            )
            .await?;
        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_call result is not a string"))?;
        hex::decode(raw.trim_start_matches("0x")).context("failed to decode eth_call result")
    }

    pub async fn block_number(&self) -> Result<u64> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_blockNumber result is not a string"))?;
        parse_quantity(raw)
    }

    /// Unix timestamp of a block.
    pub async fn block_timestamp(&self, number: u64) -> Result<i64> {
        let result = self
            .request(
                "eth_getBlockByNumber",
                json!([format!("0x{number:x}"), false]),
            )
            .await?;
        let raw = result
            .get("timestamp")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("block {number} has no timestamp"))?;
        Ok(parse_quantity(raw)? as i64)
    }

    /// Fetch logs for one contract and one topic0 over a block range.
    pub async fn get_logs(
        &self,
        address: &str,
        topic0: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>> {
        let result = self
            .request(
                "eth_getLogs",
                json!([{
                    "address": address,
                    "topics": [topic0],
                    "fromBlock": format!("0x{from_block:x}"),
                    "toBlock": format!("0x{to_block:x}"),
                }]),
            )
            .await?;
        serde_json::from_value(result).context("failed to parse eth_getLogs result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_tag() {
        assert_eq!(BlockRef::Latest.to_tag(), "latest");
        assert_eq!(BlockRef::Number(0x12).to_tag(), "0x12");
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x10").unwrap(), 16);
        assert!(parse_quantity("0xzz").is_err());
    }
}

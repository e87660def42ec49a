//! JSON-RPC adapter for chain plugin sidecars
//!
//! Binary fields travel base64-encoded. The plugin owns the chain-specific
//! transaction format; this side only forwards packages and reads results.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::{ChainClient, SubmitReceipt, TxResult, TxStatus};
use crate::models::{Block, CrossChainMessage};
use crate::types::{ChainKey, Identity, NotifyTaskType};

/// JSON-RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockDto {
    height: u64,
    hash: String,
    timestamp: i64,
    #[serde(default)]
    messages: Vec<MessageDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDto {
    tx_id: String,
    index: i32,
    raw_am: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptDto {
    tx_id: String,
    confirmed: bool,
    success: bool,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxResultDto {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

pub struct HttpChainClient {
    chain: ChainKey,
    url: String,
    client: Client,
}

impl HttpChainClient {
    pub fn new(chain: ChainKey, url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build HTTP client")?;

        Ok(Self { chain, url, client })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let response: RpcResponse<T> = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .wrap_err_with(|| format!("{} request to plugin of {} failed", method, self.chain))?
            .json()
            .await
            .wrap_err_with(|| format!("Invalid {} response from plugin of {}", method, self.chain))?;

        if let Some(err) = response.error {
            return Err(eyre!("{} failed on {}: {} (code {})", method, self.chain, err.message, err.code));
        }
        response
            .result
            .ok_or_else(|| eyre!("{} on {} returned no result", method, self.chain))
    }

    fn decode_block(&self, dto: BlockDto) -> Result<Block> {
        let engine = base64::engine::general_purpose::STANDARD;
        let messages = dto
            .messages
            .into_iter()
            .map(|m| {
                Ok(CrossChainMessage {
                    raw_am: engine
                        .decode(&m.raw_am)
                        .wrap_err_with(|| format!("Invalid base64 AM in tx {}", m.tx_id))?,
                    tx_id: m.tx_id,
                    index_in_block: m.index,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Block {
            chain: self.chain.clone(),
            height: dto.height,
            hash: dto.hash,
            timestamp: DateTime::<Utc>::from_timestamp(dto.timestamp, 0).unwrap_or_default(),
            messages,
        })
    }
}

fn parse_tx_status(status: &str) -> Result<TxStatus> {
    match status {
        "pending" => Ok(TxStatus::Pending),
        "success" => Ok(TxStatus::Success),
        "failed" => Ok(TxStatus::Failed),
        other => Err(eyre!("unknown tx status '{}'", other)),
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn last_block_height(&self) -> Result<u64> {
        self.call("getLastBlockHeight", json!({})).await
    }

    async fn block_at_height(&self, height: u64) -> Result<Block> {
        let dto: BlockDto = self.call("getBlockAtHeight", json!({ "height": height })).await?;
        if dto.height != height {
            return Err(eyre!(
                "plugin of {} returned block {} for height {}",
                self.chain,
                dto.height,
                height
            ));
        }
        self.decode_block(dto)
    }

    async fn is_contract_deployed(&self, task: NotifyTaskType) -> Result<bool> {
        self.call("isContractDeployed", json!({ "task": task.as_str() }))
            .await
    }

    async fn submit_package(&self, package: &[u8]) -> Result<SubmitReceipt> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(package);
        let dto: ReceiptDto = self
            .call("submitPackage", json!({ "package": encoded }))
            .await?;
        Ok(SubmitReceipt {
            tx_id: dto.tx_id,
            confirmed: dto.confirmed,
            success: dto.success,
            error_message: dto.error_message,
        })
    }

    async fn query_on_chain_sequence(
        &self,
        sender_domain: &str,
        sender: &Identity,
        receiver_domain: &str,
        receiver: &Identity,
    ) -> Result<i64> {
        self.call(
            "querySdpSequence",
            json!({
                "senderDomain": sender_domain,
                "senderId": sender.to_hex(),
                "receiverDomain": receiver_domain,
                "receiverId": receiver.to_hex(),
            }),
        )
        .await
    }

    async fn query_tx_result(&self, tx_id: &str) -> Result<TxResult> {
        let dto: TxResultDto = self.call("queryTxResult", json!({ "txId": tx_id })).await?;
        Ok(TxResult {
            status: parse_tx_status(&dto.status)?,
            error_message: dto.error_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_block_dto() {
        let client = HttpChainClient::new(
            ChainKey::new("eth", "eth-1"),
            "http://localhost:9000".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();
        let dto: BlockDto = serde_json::from_value(json!({
            "height": 12,
            "hash": "0xabc",
            "timestamp": 1700000000,
            "messages": [{ "txId": "0xtx", "index": 0, "rawAm": "AQID" }]
        }))
        .unwrap();

        let block = client.decode_block(dto).unwrap();
        assert_eq!(block.height, 12);
        assert_eq!(block.messages[0].raw_am, vec![1, 2, 3]);
        assert_eq!(block.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_tx_status() {
        assert_eq!(parse_tx_status("success").unwrap(), TxStatus::Success);
        assert_eq!(parse_tx_status("pending").unwrap(), TxStatus::Pending);
        assert!(parse_tx_status("weird").is_err());
    }

    #[test]
    fn test_rpc_error_response_parses() {
        let resp: RpcResponse<u64> = serde_json::from_value(json!({
            "error": { "code": -32000, "message": "boom" }
        }))
        .unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().message, "boom");
    }
}

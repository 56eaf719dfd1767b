//! JSON-RPC client for EVM chains.
//!
//! Read-side capability only: balances, nonces, gas price, transaction and
//! receipt lookups. Contract construction and signing live in operation
//! handlers; they can reuse [`EvmChainClient::request`] for raw calls.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::{debug, instrument};

use crate::domain::{
    AppError, ChainClient, ChainError, ChainTransaction, TransactionReceipt,
};

/// Configuration for the EVM RPC client
#[derive(Debug, Clone)]
pub struct EvmClientConfig {
    pub timeout: Duration,
    /// Receipt polling interval for confirmation waits
    pub poll_interval: Duration,
}

impl Default for EvmClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
        }
    }
}

pub struct EvmChainClient {
    http_client: Client,
    rpc_url: String,
    chain_id: u64,
    /// Wallet address this client submits for
    address: String,
    poll_interval: Duration,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: String,
    nonce: String,
    block_number: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: String,
    status: String,
}

impl EvmChainClient {
    pub fn new(
        rpc_url: &str,
        chain_id: u64,
        address: &str,
        config: EvmClientConfig,
    ) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ChainError::Connection(e.to_string()))?;
        Ok(Self {
            http_client,
            rpc_url: rpc_url.to_string(),
            chain_id,
            address: address.to_string(),
            poll_interval: config.poll_interval,
        })
    }

    /// Send a raw JSON-RPC request. Exposed so operation handlers can issue
    /// chain-specific calls (e.g. `eth_sendRawTransaction`) through the same
    /// endpoint and error classification.
    #[instrument(skip(self, params), fields(chain_id = self.chain_id))]
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, AppError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::Connection(e.to_string()))?;

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?;

        if let Some(error) = body.error {
            debug!(method, code = error.code, message = %error.message, "rpc error reply");
            return Err(classify_rpc_error(error.code, &error.message).into());
        }
        // A null result is legitimate for lookups that may miss, so the
        // target type decides: `Option<T>` accepts it, anything else rejects.
        serde_json::from_value(body.result.unwrap_or(serde_json::Value::Null))
            .map_err(|e| ChainError::InvalidResponse(format!("{}: {}", method, e)).into())
    }

    async fn get_block_number(&self) -> Result<u64, AppError> {
        let hex: String = self.request("eth_blockNumber", json!([])).await?;
        Ok(parse_quantity(&hex)? as u64)
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.get_block_number().await?;
        Ok(())
    }

    async fn get_balance(&self, address: &str) -> Result<u128, AppError> {
        let hex: String = self
            .request("eth_getBalance", json!([address, "latest"]))
            .await?;
        parse_quantity(&hex)
    }

    async fn get_transaction_count(&self, address: &str) -> Result<u64, AppError> {
        let hex: String = self
            .request("eth_getTransactionCount", json!([address, "latest"]))
            .await?;
        Ok(parse_quantity(&hex)? as u64)
    }

    async fn get_gas_price(&self) -> Result<u64, AppError> {
        let hex: String = self.request("eth_gasPrice", json!([])).await?;
        Ok(parse_quantity(&hex)? as u64)
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<ChainTransaction>, AppError> {
        let tx: Option<RpcTransaction> = self
            .request("eth_getTransactionByHash", json!([hash]))
            .await?;
        tx.map(|t| {
            Ok(ChainTransaction {
                hash: t.hash,
                nonce: parse_quantity(&t.nonce)? as u64,
                block_number: t
                    .block_number
                    .map(|b| parse_quantity(&b).map(|n| n as u64))
                    .transpose()?,
            })
        })
        .transpose()
    }

    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<TransactionReceipt>, AppError> {
        let receipt: Option<RpcReceipt> = self
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        receipt
            .map(|r| {
                Ok(TransactionReceipt {
                    transaction_hash: r.transaction_hash,
                    block_number: parse_quantity(&r.block_number)? as u64,
                    status: parse_quantity(&r.status)? == 1,
                })
            })
            .transpose()
    }

    async fn wait_for_transaction(
        &self,
        hash: &str,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<Option<TransactionReceipt>, AppError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(receipt) = self.get_transaction_receipt(hash).await? {
                if confirmations <= 1 {
                    return Ok(Some(receipt));
                }
                let head = self.get_block_number().await?;
                if head.saturating_sub(receipt.block_number) + 1 >= confirmations {
                    return Ok(Some(receipt));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Parse a 0x-prefixed hex quantity
fn parse_quantity(hex: &str) -> Result<u128, AppError> {
    let digits = hex.strip_prefix("0x").unwrap_or(hex);
    if digits.is_empty() {
        return Err(ChainError::InvalidResponse(format!("empty quantity: {:?}", hex)).into());
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| ChainError::InvalidResponse(format!("bad quantity {:?}: {}", hex, e)).into())
}

/// Map a JSON-RPC error reply to a typed chain error. Node implementations
/// word nonce rejections differently, so this matches on substrings.
pub fn classify_rpc_error(code: i64, message: &str) -> ChainError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("nonce too low")
        || lowered.contains("invalid nonce")
        || lowered.contains("nonce has already been used")
    {
        return ChainError::NonceExpired(message.to_string());
    }
    ChainError::Rpc(format!("rpc error {}: {}", code, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_parsing() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x7").unwrap(), 7);
        assert_eq!(parse_quantity("0x4a817c800").unwrap(), 20_000_000_000);
        assert!(parse_quantity("0x").is_err());
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn nonce_rejections_are_classified() {
        assert!(matches!(
            classify_rpc_error(-32000, "nonce too low"),
            ChainError::NonceExpired(_)
        ));
        assert!(matches!(
            classify_rpc_error(-32000, "Invalid nonce: expected 7"),
            ChainError::NonceExpired(_)
        ));
        assert!(matches!(
            classify_rpc_error(-32000, "insufficient funds"),
            ChainError::Rpc(_)
        ));
    }
}

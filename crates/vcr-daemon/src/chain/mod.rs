//! Read-only client for the on-chain app registry.
//!
//! The poller only ever reads: app status, the latest release pointer, and
//! the `AppUpgraded` event log. The [`ChainReader`] trait is the seam tests
//! mock; [`RpcChainReader`] is the production implementation speaking
//! Ethereum JSON-RPC over HTTP.

pub mod abi;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use self::abi::{AppUpgradedPayload, AbiError};

/// Errors produced by chain reads.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChainError {
    /// Transport-level failure.
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The node returned a JSON-RPC error object.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The response did not have the expected shape.
    #[error("malformed rpc response: {0}")]
    MalformedResponse(String),

    /// An event payload failed to decode.
    #[error("abi decode failed: {0}")]
    Abi(#[from] AbiError),
}

/// One decoded `AppUpgraded` event together with its block position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppUpgradedEvent {
    pub block_number: u64,
    pub payload: AppUpgradedPayload,
}

/// Read-only view of the registry contract.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Returns the app's registry status; zero means not registered.
    async fn app_status(&self, app_address: &str) -> Result<u64, ChainError>;

    /// Returns the block number of the app's latest release.
    async fn latest_release_block(&self, app_address: &str) -> Result<u64, ChainError>;

    /// Returns decoded `AppUpgraded` events for the app over the inclusive
    /// block range.
    async fn app_upgraded_events(
        &self,
        app_address: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<AppUpgradedEvent>, ChainError>;
}

const GET_APP_STATUS: &str = "getAppStatus(address)";
const GET_LATEST_RELEASE_BLOCK: &str = "getAppLatestReleaseBlockNumber(address)";

/// JSON-RPC implementation of [`ChainReader`].
pub struct RpcChainReader {
    client: reqwest::Client,
    rpc_url: String,
    app_controller: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct LogEntry {
    data: String,
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
}

impl RpcChainReader {
    /// Creates a reader against the given RPC endpoint and registry address.
    #[must_use]
    pub fn new(rpc_url: String, app_controller: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            rpc_url,
            app_controller,
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        debug!(method, "rpc request");
        let response: RpcResponse = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        response
            .result
            .ok_or_else(|| ChainError::MalformedResponse("missing result".to_string()))
    }

    async fn eth_call_uint(&self, signature: &str, app_address: &str) -> Result<u64, ChainError> {
        let data = abi::encode_address_call(signature, app_address)?;
        let result = self
            .rpc(
                "eth_call",
                json!([{ "to": self.app_controller, "data": data }, "latest"]),
            )
            .await?;
        let hex_result = result
            .as_str()
            .ok_or_else(|| ChainError::MalformedResponse("eth_call result not a string".to_string()))?;
        Ok(abi::decode_uint_result(hex_result)?)
    }
}

fn parse_quantity(raw: &str) -> Result<u64, ChainError> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|_| ChainError::MalformedResponse(format!("bad quantity: {raw}")))
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn app_status(&self, app_address: &str) -> Result<u64, ChainError> {
        self.eth_call_uint(GET_APP_STATUS, app_address).await
    }

    async fn latest_release_block(&self, app_address: &str) -> Result<u64, ChainError> {
        self.eth_call_uint(GET_LATEST_RELEASE_BLOCK, app_address).await
    }

    async fn app_upgraded_events(
        &self,
        app_address: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<AppUpgradedEvent>, ChainError> {
        let filter = json!([{
            "address": self.app_controller,
            "topics": [abi::app_upgraded_topic0(), abi::address_topic(app_address)?],
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
        }]);
        let result = self.rpc("eth_getLogs", filter).await?;
        let entries: Vec<LogEntry> = serde_json::from_value(result)
            .map_err(|e| ChainError::MalformedResponse(e.to_string()))?;

        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            let block_number = match entry.block_number.as_deref() {
                Some(raw) => parse_quantity(raw)?,
                // Pending logs carry no block number; attribute them to the
                // top of the scanned range.
                None => to_block,
            };
            events.push(AppUpgradedEvent {
                block_number,
                payload: abi::decode_app_upgraded(&entry.data)?,
            });
        }
        Ok(events)
    }
}

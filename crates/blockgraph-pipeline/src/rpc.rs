//! JSON-RPC block source.
//!
//! Adapts any EVM JSON-RPC transport to [`BlockSource`] using
//! `eth_blockNumber`, `eth_getBlockByNumber`, `eth_getBlockByHash` and
//! `eth_getLogs` filtered by block hash, so logs always belong to the exact
//! block the cursor accepted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use blockgraph_core::error::SourceError;
use blockgraph_core::source::BlockSource;
use blockgraph_core::types::{Block, BlockId, BlockPtr, ChainEvent};

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash")]
    pub block_hash: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Result<u64, SourceError> {
        parse_hex_u64(&self.block_number)
    }

    pub fn log_index_u32(&self) -> Result<u32, SourceError> {
        let index = parse_hex_u64(&self.log_index)?;
        u32::try_from(index).map_err(|_| SourceError::Decode(format!("log index {index} out of range")))
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    pub fn into_event(self) -> Result<ChainEvent, SourceError> {
        Ok(ChainEvent {
            block_number: self.block_number_u64()?,
            log_index: self.log_index_u32()?,
            address: self.address,
            topics: self.topics,
            data: self.data,
            tx_hash: self.tx_hash,
        })
    }
}

/// A JSON-RPC transport. Connection setup and auth live with the implementor.
///
/// Implementations map network failures, timeouts and rate limits to
/// [`SourceError::Transient`].
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, SourceError>;
}

/// [`BlockSource`] over an [`EvmRpcClient`].
pub struct RpcBlockSource<C> {
    client: C,
}

impl<C: EvmRpcClient> RpcBlockSource<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Current head block number.
    pub async fn head_number(&self) -> Result<u64, SourceError> {
        let v = self.client.call("eth_blockNumber", json!([])).await?;
        let hex = v
            .as_str()
            .ok_or_else(|| SourceError::Decode(format!("eth_blockNumber returned {v}")))?;
        parse_hex_u64(hex)
    }
}

#[async_trait]
impl<C: EvmRpcClient> BlockSource for RpcBlockSource<C> {
    async fn get_head(&self) -> Result<Block, SourceError> {
        let number = self.head_number().await?;
        // The head can move between the two calls; a missing block here is
        // the endpoint's own reorg and is worth retrying.
        self.get_block(&BlockId::Number(number))
            .await?
            .ok_or_else(|| SourceError::Transient(format!("head block {number} not returned")))
    }

    async fn get_block(&self, id: &BlockId) -> Result<Option<Block>, SourceError> {
        let v = match id {
            BlockId::Number(n) => {
                self.client
                    .call("eth_getBlockByNumber", json!([format!("0x{n:x}"), false]))
                    .await?
            }
            BlockId::Hash(h) => self.client.call("eth_getBlockByHash", json!([h, false])).await?,
        };
        block_from_json(&v)
    }

    async fn get_events(&self, block: &BlockPtr) -> Result<Vec<ChainEvent>, SourceError> {
        let v = self
            .client
            .call("eth_getLogs", json!([{ "blockHash": block.hash }]))
            .await?;
        let logs: Vec<RawLog> =
            serde_json::from_value(v).map_err(|e| SourceError::Decode(format!("eth_getLogs: {e}")))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if log.is_removed() {
                continue;
            }
            if !log.block_hash.eq_ignore_ascii_case(&block.hash) {
                return Err(SourceError::Decode(format!(
                    "log from block {} returned for {}",
                    log.block_hash, block.hash
                )));
            }
            events.push(log.into_event()?);
        }
        events.sort_by_key(|e| e.log_index);
        Ok(events)
    }
}

/// Parse a hex-encoded string (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, SourceError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| SourceError::Decode(format!("bad hex quantity '{s}': {e}")))
}

/// Convert a JSON-RPC block object to a [`Block`]. `null` means not found.
pub fn block_from_json(v: &Value) -> Result<Option<Block>, SourceError> {
    if v.is_null() {
        return Ok(None);
    }
    let field = |name: &str| {
        v[name]
            .as_str()
            .ok_or_else(|| SourceError::Decode(format!("block field '{name}' missing in {v}")))
    };
    Ok(Some(Block::new(
        parse_hex_u64(field("number")?)?,
        field("hash")?,
        field("parentHash")?,
        parse_hex_u64(field("timestamp")?)? as i64,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Answers from a fixed table keyed by `method` + serialized params.
    #[derive(Default)]
    struct ScriptedClient {
        responses: Mutex<HashMap<String, Value>>,
    }

    impl ScriptedClient {
        fn on(self, method: &str, params: Value, response: Value) -> Self {
            self.responses.lock().insert(format!("{method}{params}"), response);
            self
        }
    }

    #[async_trait]
    impl EvmRpcClient for ScriptedClient {
        async fn call(&self, method: &str, params: Value) -> Result<Value, SourceError> {
            self.responses
                .lock()
                .get(&format!("{method}{params}"))
                .cloned()
                .ok_or_else(|| SourceError::Transient(format!("no response for {method}")))
        }
    }

    fn block_json(n: u64, hash: &str, parent: &str) -> Value {
        json!({
            "number": format!("0x{n:x}"),
            "hash": hash,
            "parentHash": parent,
            "timestamp": "0x65000000",
            "transactions": []
        })
    }

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(parse_hex_u64("0x1").unwrap(), 1);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u64("1234").unwrap(), 0x1234);
        assert!(matches!(parse_hex_u64("0xzz"), Err(SourceError::Decode(_))));
    }

    #[test]
    fn raw_log_fields() {
        let log = RawLog {
            address: "0x0".into(),
            topics: vec![],
            data: "0x".into(),
            block_number: "0x12a05f200".into(), // 5_000_000_000
            block_hash: "0x0".into(),
            tx_hash: "0x0".into(),
            log_index: "0x5".into(),
            removed: None,
        };
        assert_eq!(log.block_number_u64().unwrap(), 5_000_000_000);
        assert_eq!(log.log_index_u32().unwrap(), 5);
        assert!(!log.is_removed());
    }

    #[test]
    fn null_block_is_not_found() {
        assert_eq!(block_from_json(&Value::Null).unwrap(), None);
        assert!(block_from_json(&json!({ "number": "0x1" })).is_err());
    }

    #[tokio::test]
    async fn head_and_blocks() {
        let client = ScriptedClient::default()
            .on("eth_blockNumber", json!([]), json!("0x10"))
            .on(
                "eth_getBlockByNumber",
                json!(["0x10", false]),
                block_json(16, "0xb16", "0xb15"),
            )
            .on("eth_getBlockByHash", json!(["0xb15", false]), block_json(15, "0xb15", "0xb14"))
            .on("eth_getBlockByHash", json!(["0xgone", false]), Value::Null);
        let source = RpcBlockSource::new(client);

        let head = source.get_head().await.unwrap();
        assert_eq!(head.ptr(), BlockPtr::new(16, "0xb16"));
        assert_eq!(head.timestamp, 0x65000000);

        let parent = source.get_block(&BlockId::Hash("0xb15".into())).await.unwrap().unwrap();
        assert!(head.extends(&parent));
        assert_eq!(source.get_block(&BlockId::Hash("0xgone".into())).await.unwrap(), None);

        let ancestor = source.get_ancestor("0xb16", 0).await;
        assert!(ancestor.is_err(), "0xb16 by hash is not scripted");
    }

    #[tokio::test]
    async fn events_by_block_hash_in_log_order() {
        let log = |index: &str, removed: bool| {
            json!({
                "address": "0xToken",
                "topics": ["0xddf252ad"],
                "data": "0x",
                "blockNumber": "0x10",
                "blockHash": "0xb16",
                "transactionHash": "0xt1",
                "logIndex": index,
                "removed": removed
            })
        };
        let client = ScriptedClient::default().on(
            "eth_getLogs",
            json!([{ "blockHash": "0xb16" }]),
            json!([log("0x2", false), log("0x0", false), log("0x1", true)]),
        );
        let source = RpcBlockSource::new(client);

        let events = source.get_events(&BlockPtr::new(16, "0xb16")).await.unwrap();
        assert_eq!(events.iter().map(|e| e.log_index).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(events[0].block_number, 16);
    }
}

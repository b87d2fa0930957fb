//! Upstream contract: the block stream the projection loop consumes and the
//! decoder turning raw logs into named field values. `rpc` adapts an EVM
//! JSON-RPC endpoint onto the stream contract.

mod decoder;
mod rpc;

use alloy::primitives::B256;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use crate::sqlspec::TagMap;
pub use decoder::{AbiDecoder, DecodeError, DecodedValue, EventAbi, EventDecoder};
pub use rpc::RpcChain;

/// Upper bound of a subscription: catch up to the tip once, or follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bound {
    Latest,
    Stream,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("rpc error: {0}")]
    Rpc(String),
}

/// Context attached to every delivered event.
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub event_type: String,
    pub height: u64,
    pub tx_hash: String,
    pub index: u64,
}

/// The raw log payload, decoded against an event ABI downstream.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
}

/// One execution event plus the tag map the filters match on.
#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub header: EventHeader,
    pub log: LogRecord,
    pub tags: TagMap,
}

#[derive(Debug, Clone)]
pub struct TxExecution {
    pub tx_hash: String,
    pub index: u64,
    pub tx_type: String,
    pub events: Vec<BlockEvent>,
    pub envelope: JsonValue,
    pub result: JsonValue,
    pub receipt: JsonValue,
    pub exception: Option<String>,
}

/// One fully-received block; the projection loop turns each into one batch.
#[derive(Debug, Clone)]
pub struct StreamedBlock {
    pub height: u64,
    pub header: JsonValue,
    pub txs: Vec<TxExecution>,
}

#[async_trait]
pub trait BlockStream: Send {
    /// Next block, strictly ascending by height. `Ok(None)` is end of
    /// stream: normal termination under [`Bound::Latest`], a reconnect
    /// trigger under [`Bound::Stream`].
    async fn recv(&mut self) -> Result<Option<StreamedBlock>, ChainError>;
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn subscribe(
        &self,
        from_height: u64,
        bound: Bound,
    ) -> Result<Box<dyn BlockStream>, ChainError>;
}

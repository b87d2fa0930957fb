use std::time::Duration;

use alloy::network::Ethereum;
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{BlockId, BlockNumberOrTag, Filter as LogFilter, Log};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use url::Url;

use super::{
    BlockEvent, BlockStream, Bound, ChainClient, ChainError, EventHeader, LogRecord,
    StreamedBlock, TagMap, TxExecution,
};

/// EVM JSON-RPC implementation of the stream contract: polls block numbers
/// and collects each block's logs with `eth_getLogs`, one block per `recv`.
pub struct RpcChain {
    provider: RootProvider<Ethereum>,
    poll_interval: Duration,
}

impl RpcChain {
    pub fn from_url(url: &str, poll_interval: Duration) -> Result<Self, ChainError> {
        let url = Url::parse(url).map_err(|e| ChainError::Endpoint(e.to_string()))?;
        Ok(Self { provider: RootProvider::<Ethereum>::new_http(url), poll_interval })
    }
}

#[async_trait]
impl ChainClient for RpcChain {
    async fn subscribe(
        &self,
        from_height: u64,
        bound: Bound,
    ) -> Result<Box<dyn BlockStream>, ChainError> {
        let tip = self.provider.get_block_number().await.map_err(rpc_err)?;
        let until = match bound {
            Bound::Latest => Some(tip),
            Bound::Stream => None,
        };
        tracing::info!(from_height, tip, "subscribed to block stream");
        Ok(Box::new(RpcBlockStream {
            provider: self.provider.clone(),
            next: from_height,
            until,
            poll_interval: self.poll_interval,
        }))
    }
}

struct RpcBlockStream {
    provider: RootProvider<Ethereum>,
    next: u64,
    until: Option<u64>,
    poll_interval: Duration,
}

#[async_trait]
impl BlockStream for RpcBlockStream {
    async fn recv(&mut self) -> Result<Option<StreamedBlock>, ChainError> {
        if let Some(until) = self.until {
            if self.next > until {
                return Ok(None);
            }
        }

        // Wait until the chain has produced the next block.
        loop {
            let tip = self.provider.get_block_number().await.map_err(rpc_err)?;
            if tip >= self.next {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let height = self.next;
        let header = self
            .provider
            .get_block(BlockId::Number(BlockNumberOrTag::Number(height)))
            .await
            .map_err(rpc_err)?
            .and_then(|block| serde_json::to_value(&block.header).ok())
            .unwrap_or_else(|| json!({ "height": height }));

        let filter = LogFilter::new().from_block(height).to_block(height);
        let logs = self.provider.get_logs(&filter).await.map_err(rpc_err)?;

        self.next += 1;
        Ok(Some(assemble_block(height, header, &logs)))
    }
}

fn rpc_err(e: impl std::fmt::Display) -> ChainError {
    ChainError::Rpc(e.to_string())
}

/// Group a block's logs by transaction, in delivery order, and synthesize
/// the tag map filters match on.
fn assemble_block(height: u64, header: JsonValue, logs: &[Log]) -> StreamedBlock {
    let mut txs: Vec<TxExecution> = Vec::new();

    for log in logs {
        let tx_hash = log.transaction_hash.map(|h| format!("{h:#x}")).unwrap_or_default();
        let event = BlockEvent {
            header: EventHeader {
                event_type: "LogEvent".to_string(),
                height,
                tx_hash: tx_hash.clone(),
                index: log.log_index.unwrap_or_default(),
            },
            log: LogRecord { topics: log.topics().to_vec(), data: log.data().data.to_vec() },
            tags: event_tags(height, &tx_hash, log),
        };

        match txs.iter_mut().find(|tx| tx.tx_hash == tx_hash) {
            Some(tx) => tx.events.push(event),
            None => txs.push(TxExecution {
                tx_hash,
                index: log.transaction_index.unwrap_or_default(),
                tx_type: "call".to_string(),
                events: vec![event],
                envelope: JsonValue::Null,
                result: JsonValue::Null,
                receipt: JsonValue::Null,
                exception: None,
            }),
        }
    }

    StreamedBlock { height, header, txs }
}

fn event_tags(height: u64, tx_hash: &str, log: &Log) -> TagMap {
    let mut tags = TagMap::new();
    tags.insert("EventType".to_string(), "LogEvent".to_string());
    tags.insert("Height".to_string(), height.to_string());
    tags.insert("TxHash".to_string(), tx_hash.to_string());
    tags.insert("Address".to_string(), log.address().to_string());
    for (i, topic) in log.topics().iter().enumerate() {
        tags.insert(format!("Log{i}"), format!("{topic:#x}"));
    }
    tags
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, Bytes, LogData, B256};

    use super::*;

    fn log(tx: u8, topic0: B256) -> Log {
        let mut log = Log::default();
        log.inner.address = Address::repeat_byte(0x22);
        log.inner.data = LogData::new_unchecked(vec![topic0], Bytes::from(vec![0u8; 32]));
        log.transaction_hash = Some(B256::repeat_byte(tx));
        log.transaction_index = Some(tx as u64);
        log.log_index = Some(tx as u64);
        log
    }

    #[test]
    fn test_logs_group_by_transaction() {
        let topic = B256::repeat_byte(0xaa);
        let logs = vec![log(1, topic), log(1, topic), log(2, topic)];
        let block = assemble_block(7, json!({ "height": 7 }), &logs);

        assert_eq!(block.height, 7);
        assert_eq!(block.txs.len(), 2);
        assert_eq!(block.txs[0].events.len(), 2);
        assert_eq!(block.txs[1].events.len(), 1);
    }

    #[test]
    fn test_tags_carry_topics_and_address() {
        let topic = B256::repeat_byte(0xaa);
        let block = assemble_block(7, JsonValue::Null, &[log(1, topic)]);
        let tags = &block.txs[0].events[0].tags;

        assert_eq!(tags["EventType"], "LogEvent");
        assert_eq!(tags["Height"], "7");
        assert_eq!(tags["Log0"], format!("{topic:#x}"));
        assert!(tags.contains_key("Address"));
    }
}

//! Streaming projection loop: subscribes from the last committed height,
//! matches and decodes events into per-block batches, and commits each
//! batch through the writer task. Blocks are processed strictly in
//! ascending height order; no two blocks commit concurrently.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::chain::{
    AbiDecoder, BlockEvent, BlockStream, Bound, ChainClient, ChainError, DecodeError,
    DecodedValue, EventDecoder, StreamedBlock,
};
use crate::config::VentConfig;
use crate::db::{DbError, VentDb};
use crate::sqlspec::{self, Catalog, EventBinding, SpecError};
use crate::types::{
    block_capture_table, tx_capture_table, BlockBatch, EventRow, SqlColumn, SqlColumnType,
    SqlValue, BLOCK_TABLE, COL_BLOCK_HEADER, COL_ENVELOPE, COL_EVENTS, COL_EVENT_NAME,
    COL_EVENT_TYPE, COL_EXCEPTION, COL_HEIGHT, COL_INDEX, COL_RECEIPT, COL_RESULT, COL_TX_HASH,
    COL_TX_TYPE, TX_TABLE,
};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("spec error: {0}")]
    Spec(#[from] SpecError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("stream error: {0}")]
    Chain(#[from] ChainError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("stored height {0:?} is not numeric")]
    BadHeight(String),

    #[error("cannot bind value {value:?} to column {column}")]
    BadValue { column: String, value: String },

    #[error("writer task failed: {0}")]
    Writer(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Init = 0,
    Subscribing = 1,
    Receiving = 2,
    Draining = 3,
    Closed = 4,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Init => "init",
            ConsumerState::Subscribing => "subscribing",
            ConsumerState::Receiving => "receiving",
            ConsumerState::Draining => "draining",
            ConsumerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Read-only view of the consumer state, for health reporting.
#[derive(Clone)]
pub struct StateHandle(Arc<AtomicU8>);

impl StateHandle {
    pub fn get(&self) -> ConsumerState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConsumerState::Init,
            1 => ConsumerState::Subscribing,
            2 => ConsumerState::Receiving,
            3 => ConsumerState::Draining,
            _ => ConsumerState::Closed,
        }
    }
}

/// Signals the consumer to stop pulling blocks and drain.
pub struct Shutdown(watch::Sender<bool>);

impl Shutdown {
    pub fn signal(&self) {
        let _ = self.0.send(true);
    }
}

enum Outcome {
    Eof,
    Drained,
}

pub struct Consumer {
    config: VentConfig,
    catalog: Arc<Catalog>,
    decoder: Arc<dyn EventDecoder>,
    chain: Box<dyn ChainClient>,
    state: Arc<AtomicU8>,
    shutdown: watch::Receiver<bool>,
}

impl Consumer {
    /// Load and validate the table specs, derive the decoder from them, and register
    /// the raw capture tables when enabled.
    pub fn new(
        config: VentConfig,
        chain: Box<dyn ChainClient>,
    ) -> Result<(Self, Shutdown), ConsumerError> {
        let mut catalog = if config.spec_path.is_dir() {
            sqlspec::parse_folder(&config.spec_path)?
        } else {
            sqlspec::parse_file(&config.spec_path)?
        };
        let decoder = AbiDecoder::from_catalog(&catalog)?;

        if config.capture_block_tx {
            catalog.insert_schema(block_capture_table());
            catalog.insert_schema(tx_capture_table());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = Self {
            config,
            catalog: Arc::new(catalog),
            decoder: Arc::new(decoder),
            chain,
            state: Arc::new(AtomicU8::new(ConsumerState::Init as u8)),
            shutdown: shutdown_rx,
        };
        Ok((consumer, Shutdown(shutdown_tx)))
    }

    /// Replace the catalog-derived decoder, for deployments with a separate
    /// ABI source.
    pub fn with_decoder(mut self, decoder: Arc<dyn EventDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn state_handle(&self) -> StateHandle {
        StateHandle(self.state.clone())
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::SeqCst);
        tracing::debug!(%state, "consumer state");
    }

    pub async fn run(self) -> Result<(), ConsumerError> {
        self.set_state(ConsumerState::Init);
        let db = Arc::new(VentDb::open(&self.config).await?);
        db.synchronize(&self.catalog).await?;

        loop {
            self.set_state(ConsumerState::Subscribing);
            let last = db.last_block().await?;
            let from_height: u64 =
                last.trim().parse().map_err(|_| ConsumerError::BadHeight(last.clone()))?;
            tracing::info!(from_height, "subscribing to event stream");

            let stream = self.chain.subscribe(from_height, self.config.bound).await?;
            match self.pump(db.clone(), stream).await? {
                Outcome::Drained => {
                    self.set_state(ConsumerState::Closed);
                    tracing::info!("drained, shutting down");
                    return Ok(());
                }
                Outcome::Eof => match self.config.bound {
                    Bound::Latest => {
                        self.set_state(ConsumerState::Closed);
                        tracing::info!("caught up to the latest block");
                        return Ok(());
                    }
                    Bound::Stream => {
                        tracing::info!("stream ended, resubscribing from last committed height");
                    }
                },
            }
        }
    }

    /// Receive blocks and feed the writer until EOF, shutdown or error. The
    /// bounded channel gives the receiver backpressure while a commit is in
    /// flight; dropping the sender drains the writer.
    async fn pump(
        &self,
        db: Arc<VentDb>,
        mut stream: Box<dyn BlockStream>,
    ) -> Result<Outcome, ConsumerError> {
        self.set_state(ConsumerState::Receiving);

        let (batch_tx, mut batch_rx) = mpsc::channel::<BlockBatch>(1);
        let writer_db = db;
        let writer_catalog = self.catalog.clone();
        let writer = tokio::spawn(async move {
            while let Some(batch) = batch_rx.recv().await {
                writer_db.set_block(&writer_catalog, &batch).await?;
                tracing::info!(height = %batch.height, rows = batch.row_count(), "committed block");
            }
            Ok::<(), DbError>(())
        });

        let mut shutdown = self.shutdown.clone();
        let mut shutdown_closed = false;

        let result: Result<Outcome, ConsumerError> = loop {
            if *shutdown.borrow() {
                break Ok(Outcome::Drained);
            }

            tokio::select! {
                changed = shutdown.changed(), if !shutdown_closed => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => break Ok(Outcome::Drained),
                        Ok(()) => {}
                        Err(_) => shutdown_closed = true,
                    }
                }
                received = stream.recv() => match received {
                    Ok(Some(block)) => match self.build_batch(&block) {
                        Ok(batch) if batch.is_empty() => {
                            tracing::debug!(height = block.height, "no matching events");
                        }
                        Ok(batch) => {
                            if batch_tx.send(batch).await.is_err() {
                                // Writer is gone; its error surfaces below.
                                break Ok(Outcome::Drained);
                            }
                        }
                        Err(e) => break Err(e),
                    },
                    Ok(None) => break Ok(Outcome::Eof),
                    Err(e) => break Err(ConsumerError::Chain(e)),
                },
            }
        };

        self.set_state(ConsumerState::Draining);
        drop(batch_tx);
        writer.await.map_err(|e| ConsumerError::Writer(e.to_string()))??;

        match result {
            Err(e) if *shutdown.borrow() => {
                tracing::debug!(error = %e, "error while draining treated as clean shutdown");
                Ok(Outcome::Drained)
            }
            other => other,
        }
    }

    /// Turn one received block into one batch: optional raw capture rows,
    /// then one projection row per (event, matching binding) pair. Events
    /// matching no binding are dropped; that is the normal projection case.
    fn build_batch(&self, block: &StreamedBlock) -> Result<BlockBatch, ConsumerError> {
        let mut batch = BlockBatch::new(block.height.to_string());

        if self.config.capture_block_tx {
            self.capture_block(&mut batch, block);
        }

        for tx in &block.txs {
            for event in &tx.events {
                let matching: Vec<&EventBinding> = self
                    .catalog
                    .bindings
                    .values()
                    .filter(|binding| binding.filter.matches(&event.tags))
                    .collect();
                if matching.is_empty() {
                    continue;
                }

                // Decode once per event, however many bindings match.
                let (event_name, fields) = self.decode_event(event)?;
                for binding in matching {
                    let row = self.project_row(binding, event, &event_name, &fields)?;
                    batch.add_row(&binding.table_name, EventRow::upsert(row));
                }
            }
        }

        Ok(batch)
    }

    fn decode_event(
        &self,
        event: &BlockEvent,
    ) -> Result<(String, HashMap<String, DecodedValue>), ConsumerError> {
        let topic0 = event.log.topics.first().ok_or_else(|| DecodeError::Unpack {
            event: "(anonymous)".to_string(),
            reason: "log carries no topics".to_string(),
        })?;
        let abi = self
            .decoder
            .lookup(topic0)
            .ok_or(DecodeError::UnknownEvent(*topic0))?;
        let fields = self.decoder.decode(abi, &event.log.topics, &event.log.data)?;
        Ok((abi.name.clone(), fields))
    }

    fn project_row(
        &self,
        binding: &EventBinding,
        event: &BlockEvent,
        event_name: &str,
        fields: &HashMap<String, DecodedValue>,
    ) -> Result<HashMap<String, SqlValue>, ConsumerError> {
        let schema = self
            .catalog
            .schema(&binding.table_name)
            .ok_or_else(|| DbError::UnknownTable(binding.table_name.clone()))?;

        let mut row = HashMap::with_capacity(fields.len() + 4);
        row.insert(COL_HEIGHT.to_string(), SqlValue::Text(event.header.height.to_string()));
        row.insert(COL_TX_HASH.to_string(), SqlValue::Text(event.header.tx_hash.clone()));
        row.insert(COL_EVENT_TYPE.to_string(), SqlValue::Text(event.header.event_type.clone()));
        row.insert(COL_EVENT_NAME.to_string(), SqlValue::Text(event_name.to_string()));

        for (field, value) in fields {
            // Fields without a mapped column are not projected.
            let Some(column_name) = binding.columns.get(field) else { continue };
            let Some(column) = schema.column(column_name) else { continue };
            row.insert(column_name.clone(), bind_value(value, column)?);
        }
        Ok(row)
    }

    fn capture_block(&self, batch: &mut BlockBatch, block: &StreamedBlock) {
        let height = block.height.to_string();

        let mut row = HashMap::new();
        row.insert(COL_HEIGHT.to_string(), SqlValue::Text(height.clone()));
        row.insert(COL_BLOCK_HEADER.to_string(), SqlValue::Text(block.header.to_string()));
        batch.add_row(BLOCK_TABLE, EventRow::upsert(row));

        for tx in &block.txs {
            let events = JsonValue::Array(
                tx.events
                    .iter()
                    .map(|event| {
                        json!({
                            "index": event.header.index,
                            "eventtype": event.header.event_type,
                            "topics": event
                                .log
                                .topics
                                .iter()
                                .map(|t| format!("{t:#x}"))
                                .collect::<Vec<_>>(),
                        })
                    })
                    .collect(),
            );

            let mut row = HashMap::new();
            row.insert(COL_HEIGHT.to_string(), SqlValue::Text(height.clone()));
            row.insert(COL_TX_HASH.to_string(), SqlValue::Text(tx.tx_hash.clone()));
            row.insert(COL_INDEX.to_string(), SqlValue::Int(tx.index as i32));
            row.insert(COL_TX_TYPE.to_string(), SqlValue::Text(tx.tx_type.clone()));
            row.insert(COL_ENVELOPE.to_string(), json_text(&tx.envelope));
            row.insert(COL_EVENTS.to_string(), SqlValue::Text(events.to_string()));
            row.insert(COL_RESULT.to_string(), json_text(&tx.result));
            row.insert(COL_RECEIPT.to_string(), json_text(&tx.receipt));
            row.insert(
                COL_EXCEPTION.to_string(),
                tx.exception.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null),
            );
            batch.add_row(TX_TABLE, EventRow::upsert(row));
        }
    }
}

fn json_text(value: &JsonValue) -> SqlValue {
    if value.is_null() {
        SqlValue::Null
    } else {
        SqlValue::Text(value.to_string())
    }
}

/// Convert a decoded value into the bind value its column expects.
fn bind_value(value: &DecodedValue, column: &SqlColumn) -> Result<SqlValue, ConsumerError> {
    Ok(match value {
        DecodedValue::Address(s) => SqlValue::Text(s.clone()),
        DecodedValue::Bool(b) => SqlValue::Bool(*b),
        DecodedValue::String(s) => SqlValue::Text(s.clone()),
        DecodedValue::Bytes(b) => {
            if column.bytes_to_string {
                // Printable projection: trailing NULs trimmed, embedded
                // ones kept.
                let text = String::from_utf8_lossy(b);
                SqlValue::Text(text.trim_end_matches('\0').to_string())
            } else {
                SqlValue::Bytes(b.clone())
            }
        }
        DecodedValue::BigInt(s) => match column.sql_type {
            SqlColumnType::Int => SqlValue::Int(s.parse().map_err(|_| {
                ConsumerError::BadValue { column: column.name.clone(), value: s.clone() }
            })?),
            SqlColumnType::Numeric => SqlValue::Numeric(s.clone()),
            _ => SqlValue::Text(s.clone()),
        },
    })
}

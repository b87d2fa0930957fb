use std::collections::HashMap;

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::{keccak256, Address, B256, I256, U256};
use thiserror::Error;

use crate::sqlspec::{Catalog, EventInput};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no event ABI registered for id {0}")]
    UnknownEvent(B256),

    #[error("could not unpack event data for {event}: {reason}")]
    Unpack { event: String, reason: String },

    #[error("unsupported input type {signature} on event {event}")]
    UnsupportedType { event: String, signature: String },
}

/// A decoded field value, already rendered into the shapes the projection
/// binds: printable addresses and decimal strings for integers of any width.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Address(String),
    BigInt(String),
    Bool(bool),
    Bytes(Vec<u8>),
    String(String),
}

#[derive(Debug, Clone)]
pub struct AbiInput {
    pub name: String,
    pub sol_type: DynSolType,
    pub indexed: bool,
}

/// Typed description of one event, keyed by its id (topic0).
#[derive(Debug, Clone)]
pub struct EventAbi {
    pub name: String,
    pub canonical_signature: String,
    pub topic0: B256,
    pub inputs: Vec<AbiInput>,
}

impl EventAbi {
    /// Build the ABI from a declared event signature. Tuple and array
    /// inputs are rejected: projection columns are scalar.
    pub fn new(name: &str, inputs: &[EventInput]) -> Result<Self, DecodeError> {
        let mut abi_inputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            let sol_type = DynSolType::parse(&input.evm_type).map_err(|_| {
                DecodeError::UnsupportedType {
                    event: name.to_string(),
                    signature: input.evm_type.clone(),
                }
            })?;
            if matches!(
                sol_type,
                DynSolType::Tuple(_) | DynSolType::Array(_) | DynSolType::FixedArray(_, _)
            ) {
                return Err(DecodeError::UnsupportedType {
                    event: name.to_string(),
                    signature: input.evm_type.clone(),
                });
            }
            abi_inputs.push(AbiInput {
                name: input.name.clone(),
                sol_type,
                indexed: input.indexed,
            });
        }

        let types: Vec<String> =
            abi_inputs.iter().map(|i| i.sol_type.sol_type_name().into_owned()).collect();
        let canonical_signature = format!("{}({})", name, types.join(","));
        let topic0 = keccak256(canonical_signature.as_bytes());

        Ok(Self { name: name.to_string(), canonical_signature, topic0, inputs: abi_inputs })
    }
}

/// Contract consumed by the projection loop: resolve an event id to its ABI
/// and unpack a raw log into named field values.
pub trait EventDecoder: Send + Sync {
    fn lookup(&self, event_id: &B256) -> Option<&EventAbi>;

    fn decode(
        &self,
        abi: &EventAbi,
        topics: &[B256],
        data: &[u8],
    ) -> Result<HashMap<String, DecodedValue>, DecodeError>;
}

/// Decoder derived from the catalog's own declared event signatures.
pub struct AbiDecoder {
    events: HashMap<B256, EventAbi>,
}

impl AbiDecoder {
    pub fn from_catalog(catalog: &Catalog) -> Result<Self, DecodeError> {
        let mut events = HashMap::new();
        for binding in catalog.bindings.values() {
            let abi = EventAbi::new(&binding.event_name, &binding.inputs)?;
            events.insert(abi.topic0, abi);
        }
        Ok(Self { events })
    }
}

impl EventDecoder for AbiDecoder {
    fn lookup(&self, event_id: &B256) -> Option<&EventAbi> {
        self.events.get(event_id)
    }

    fn decode(
        &self,
        abi: &EventAbi,
        topics: &[B256],
        data: &[u8],
    ) -> Result<HashMap<String, DecodedValue>, DecodeError> {
        let mut out = HashMap::with_capacity(abi.inputs.len());

        // Indexed inputs come word-wise from topics[1..].
        let mut topic_index = 1;
        for input in abi.inputs.iter().filter(|i| i.indexed) {
            let topic = topics.get(topic_index).ok_or_else(|| DecodeError::Unpack {
                event: abi.name.clone(),
                reason: format!("log carries {} topics, expected more", topics.len()),
            })?;
            topic_index += 1;
            out.insert(input.name.clone(), decode_topic(topic, &input.sol_type));
        }

        // The rest decode as a tuple from the data section.
        let data_inputs: Vec<&AbiInput> = abi.inputs.iter().filter(|i| !i.indexed).collect();
        if !data_inputs.is_empty() {
            let tuple =
                DynSolType::Tuple(data_inputs.iter().map(|i| i.sol_type.clone()).collect());
            match tuple.abi_decode(data) {
                Ok(DynSolValue::Tuple(values)) => {
                    for (value, input) in values.iter().zip(&data_inputs) {
                        out.insert(input.name.clone(), render_value(value, abi)?);
                    }
                }
                Ok(_) => {
                    return Err(DecodeError::Unpack {
                        event: abi.name.clone(),
                        reason: "data did not decode to a tuple".to_string(),
                    });
                }
                Err(e) => {
                    return Err(DecodeError::Unpack {
                        event: abi.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(out)
    }
}

/// Decode one 32-byte topic word. Dynamic indexed values arrive as their
/// hash and are kept as raw words.
fn decode_topic(topic: &B256, sol_type: &DynSolType) -> DecodedValue {
    match sol_type {
        DynSolType::Address => {
            DecodedValue::Address(Address::from_slice(&topic[12..]).to_string())
        }
        DynSolType::Uint(_) => DecodedValue::BigInt(U256::from_be_bytes(topic.0).to_string()),
        DynSolType::Int(_) => DecodedValue::BigInt(I256::from_be_bytes(topic.0).to_string()),
        DynSolType::Bool => DecodedValue::Bool(topic.0[31] != 0),
        DynSolType::FixedBytes(n) => DecodedValue::Bytes(topic.0[..*n].to_vec()),
        _ => DecodedValue::Bytes(topic.0.to_vec()),
    }
}

fn render_value(value: &DynSolValue, abi: &EventAbi) -> Result<DecodedValue, DecodeError> {
    match value {
        DynSolValue::Address(addr) => Ok(DecodedValue::Address(addr.to_string())),
        DynSolValue::Uint(v, _) => Ok(DecodedValue::BigInt(v.to_string())),
        DynSolValue::Int(v, _) => Ok(DecodedValue::BigInt(v.to_string())),
        DynSolValue::Bool(b) => Ok(DecodedValue::Bool(*b)),
        DynSolValue::FixedBytes(word, n) => Ok(DecodedValue::Bytes(word.0[..*n].to_vec())),
        DynSolValue::Bytes(b) => Ok(DecodedValue::Bytes(b.clone())),
        DynSolValue::String(s) => Ok(DecodedValue::String(s.clone())),
        other => Err(DecodeError::Unpack {
            event: abi.name.clone(),
            reason: format!("unsupported decoded value {other:?}"),
        }),
    }
}

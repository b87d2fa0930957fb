//! Event-to-relational projection engine: subscribes to a chain's
//! execution-event stream, decodes contract log events against declared
//! signatures, maps them through user table specs and applies the rows to a
//! SQL database atomically per block, with durable progress for restarts.
//!
//! - [`sqlspec`] parses and validates the declarative table specs into a
//!   catalog of table schemas and event bindings.
//! - [`db`] reconciles the declared schemas with the live database and
//!   commits one block of rows plus its progress log in one transaction.
//! - [`chain`] defines the upstream block stream and decoder contracts and
//!   ships an EVM JSON-RPC adapter for both.
//! - [`projection`] drives the loop: subscribe from the last committed
//!   height, batch per block, hand off to the writer.

pub mod chain;
pub mod config;
pub mod db;
pub mod projection;
pub mod sqlspec;
pub mod types;

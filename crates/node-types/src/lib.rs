//! Common types module for the oracle node chain layer.
//!
//! This module defines the data model shared by the protocol client, the
//! transaction manager and the event queue. It provides a centralized
//! location for chain types, transaction lifecycle types and the strict
//! hex quantity codec for wire quantities.

/// Wei amounts and ether-denominated balances.
pub mod amount;
/// Typed contract call payloads and function selectors.
pub mod call;
/// Block, log and receipt types as delivered by the chain node.
pub mod chain;
/// Queue payloads handed from producers to the consumer pipeline.
pub mod events;
/// Strict `0x` quantity encoding and decoding.
pub mod quantity;
/// Redacting wrapper for key material in configuration.
pub mod secret_string;
/// Storage namespaces for persisted node data.
pub mod storage;
/// Outbound transaction types and the pending transaction state machine.
pub mod transaction;
/// Utility functions for formatting and timestamps.
pub mod utils;

pub use alloy_primitives::{Address, Bytes, B256, U256};

pub use amount::*;
pub use call::*;
pub use chain::*;
pub use events::*;
pub use quantity::QuantityError;
pub use secret_string::SecretString;
pub use storage::*;
pub use transaction::*;
pub use utils::{current_timestamp, truncate_id};

/// Hash of a transaction as reported by the chain.
pub type TxHash = B256;

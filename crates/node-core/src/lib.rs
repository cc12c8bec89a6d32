//! Core of the oracle node chain layer.
//!
//! Hosts the closeable [`EventQueue`] that hands chain events to a single
//! consumer, the [`TransactionManager`] that owns outbound nonces and tracks
//! submitted transactions to confirmation, and the [`NodeEngine`] that ties
//! both to the protocol client.

pub mod engine;
pub mod manager;
pub mod queue;
pub mod state;

pub use engine::{EngineError, JobPipeline, NodeEngine};
pub use manager::{PendingTxHandle, TransactionConsumer, TransactionManager, TxmError};
pub use queue::{Delivery, EventQueue, QueueError, QueueReceiver};
pub use state::{PendingStateError, PendingTxStore};

//! Pending transaction state management.

pub mod pending;

pub use pending::{PendingStateError, PendingTxStore};

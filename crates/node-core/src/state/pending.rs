//! Pending transaction state machine and persistence.
//!
//! Transactions move `Created -> Submitted -> {Confirmed, Dropped, Replaced}`;
//! `Created -> Dropped` covers a transaction that never reached the node.
//! Live records are persisted per sender so tracking can resume after a
//! restart.

use node_storage::{StorageError, StorageService};
use node_types::{Address, PendingTx, PendingTxState, StorageKey};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during pending transaction state management.
#[derive(Debug, Error)]
pub enum PendingStateError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Invalid state transition from {from:?} to {to:?}")]
	InvalidTransition {
		from: PendingTxState,
		to: PendingTxState,
	},
}

impl From<StorageError> for PendingStateError {
	fn from(err: StorageError) -> Self {
		PendingStateError::Storage(err.to_string())
	}
}

static TRANSITIONS: Lazy<HashMap<PendingTxState, HashSet<PendingTxState>>> = Lazy::new(|| {
	let mut m = HashMap::new();
	m.insert(
		PendingTxState::Created,
		HashSet::from([PendingTxState::Submitted, PendingTxState::Dropped]),
	);
	m.insert(
		PendingTxState::Submitted,
		HashSet::from([
			PendingTxState::Confirmed,
			PendingTxState::Dropped,
			PendingTxState::Replaced,
		]),
	);
	m.insert(PendingTxState::Confirmed, HashSet::new());
	m.insert(PendingTxState::Dropped, HashSet::new());
	m.insert(PendingTxState::Replaced, HashSet::new());
	m
});

pub fn is_valid_transition(from: PendingTxState, to: PendingTxState) -> bool {
	TRANSITIONS
		.get(&from)
		.is_some_and(|allowed| allowed.contains(&to))
}

/// Moves `tx` to `to`, rejecting transitions the lifecycle does not allow.
pub fn transition(tx: &mut PendingTx, to: PendingTxState) -> Result<(), PendingStateError> {
	if !is_valid_transition(tx.state, to) {
		return Err(PendingStateError::InvalidTransition { from: tx.state, to });
	}
	tracing::trace!(nonce = tx.nonce, from = ?tx.state, to = ?to, "Pending transaction transition");
	tx.state = to;
	Ok(())
}

/// Upsert/list-by-sender persistence of pending transactions.
///
/// Each sender owns one document holding its live records.
#[derive(Clone)]
pub struct PendingTxStore {
	storage: Arc<StorageService>,
}

impl PendingTxStore {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	fn id(sender: &Address) -> String {
		format!("{:#x}", sender)
	}

	/// Replaces the stored records of `sender`. An empty set removes the
	/// document.
	pub async fn upsert(
		&self,
		sender: Address,
		records: &[PendingTx],
	) -> Result<(), PendingStateError> {
		let namespace = StorageKey::PendingTransactions.as_str();
		if records.is_empty() {
			self.storage.remove(namespace, &Self::id(&sender)).await?;
		} else {
			self.storage
				.store(namespace, &Self::id(&sender), &records)
				.await?;
		}
		Ok(())
	}

	/// Stored records of `sender`, in nonce order.
	pub async fn list(&self, sender: Address) -> Result<Vec<PendingTx>, PendingStateError> {
		let namespace = StorageKey::PendingTransactions.as_str();
		match self
			.storage
			.retrieve::<Vec<PendingTx>>(namespace, &Self::id(&sender))
			.await
		{
			Ok(mut records) => {
				records.sort_by_key(|tx| tx.nonce);
				Ok(records)
			}
			Err(StorageError::NotFound) => Ok(Vec::new()),
			Err(e) => Err(e.into()),
		}
	}

	/// Senders with stored records.
	pub async fn senders(&self) -> Result<Vec<Address>, PendingStateError> {
		let ids = self
			.storage
			.list_ids(StorageKey::PendingTransactions.as_str())
			.await?;
		Ok(ids.iter().filter_map(|id| id.parse().ok()).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use node_storage::implementations::memory::MemoryStorage;
	use node_types::{Bytes, SignedTransaction, TxRequest, B256};

	fn pending(nonce: u64, sender: Address) -> PendingTx {
		let request = TxRequest::call(1, Address::repeat_byte(0x22), Bytes::new(), 21_000);
		PendingTx::new(
			request,
			SignedTransaction {
				raw: Bytes::from_static(&[0x01]),
				hash: B256::repeat_byte(nonce as u8),
				nonce,
				from: sender,
			},
		)
	}

	#[test]
	fn test_lifecycle_transitions() {
		let sender = Address::repeat_byte(0xaa);
		let mut tx = pending(1, sender);
		assert!(transition(&mut tx, PendingTxState::Confirmed).is_err());
		transition(&mut tx, PendingTxState::Submitted).unwrap();
		transition(&mut tx, PendingTxState::Replaced).unwrap();
		assert!(matches!(
			transition(&mut tx, PendingTxState::Submitted),
			Err(PendingStateError::InvalidTransition { .. })
		));

		assert!(is_valid_transition(
			PendingTxState::Created,
			PendingTxState::Dropped
		));
		assert!(!is_valid_transition(
			PendingTxState::Confirmed,
			PendingTxState::Dropped
		));
	}

	#[tokio::test]
	async fn test_upsert_and_list_by_sender() {
		let store = PendingTxStore::new(Arc::new(StorageService::new(Box::new(
			MemoryStorage::new(),
		))));
		let alice = Address::repeat_byte(0xaa);
		let bob = Address::repeat_byte(0xbb);

		store
			.upsert(alice, &[pending(4, alice), pending(3, alice)])
			.await
			.unwrap();
		store.upsert(bob, &[pending(9, bob)]).await.unwrap();

		let nonces: Vec<_> = store
			.list(alice)
			.await
			.unwrap()
			.iter()
			.map(|tx| tx.nonce)
			.collect();
		assert_eq!(nonces, vec![3, 4]);

		let mut senders = store.senders().await.unwrap();
		senders.sort();
		assert_eq!(senders, vec![alice, bob]);

		store.upsert(alice, &[]).await.unwrap();
		assert!(store.list(alice).await.unwrap().is_empty());
		assert!(store.list(Address::ZERO).await.unwrap().is_empty());
	}
}

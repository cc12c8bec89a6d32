//! Storage namespaces.

/// Namespaces of the documents the node persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Pending transaction records, one document per sender.
	PendingTransactions,
}

impl StorageKey {
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::PendingTransactions => "pending_transactions",
		}
	}
}

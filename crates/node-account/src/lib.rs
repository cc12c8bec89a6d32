//! Signing collaborator for the transaction manager.
//!
//! The transaction manager never touches key material. It hands a sender,
//! a nonce and an unsigned request to a [`TransactionSigner`] and receives a
//! [`SignedTransaction`] back.

use async_trait::async_trait;
use node_types::{Address, SignedTransaction, TxRequest};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod local;
}

/// Errors that can occur during signing.
#[derive(Debug, Error)]
pub enum SignerError {
	/// The signer holds no key for the requested sender.
	#[error("No key for sender {0}")]
	UnknownSender(Address),
	/// The request lacks a field the signer needs.
	#[error("Incomplete transaction request: {0}")]
	IncompleteRequest(String),
	/// Error that occurs when signing operations fail.
	#[error("Signing failed: {0}")]
	SigningFailed(String),
	/// Error that occurs when a cryptographic key is invalid or malformed.
	#[error("Invalid key: {0}")]
	InvalidKey(String),
}

/// Trait defining the interface for transaction signers.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
	/// Addresses this signer can sign for.
	fn senders(&self) -> Vec<Address>;

	/// Signs `request` for `sender` at `nonce`.
	///
	/// The request must carry a gas price.
	async fn sign_transaction(
		&self,
		sender: Address,
		nonce: u64,
		request: &TxRequest,
	) -> Result<SignedTransaction, SignerError>;
}

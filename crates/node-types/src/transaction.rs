//! Outbound transaction types.
//!
//! Covers the unsigned request handed to a signer, the signed payload sent to
//! the node, the pending transaction record tracked by the transaction
//! manager, and the notifications published when a transaction reaches a
//! terminal outcome.

use crate::{TxHash, TxReceipt, WeiAmount};
use alloy_primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unsigned transaction payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
	/// Chain the transaction is bound to.
	pub chain_id: u64,
	/// Recipient; `None` deploys a contract.
	pub to: Option<Address>,
	#[serde(default)]
	pub value: WeiAmount,
	#[serde(default)]
	pub data: Bytes,
	pub gas_limit: u64,
	/// Gas price; when unset the signer or the fee policy fills it in.
	#[serde(default)]
	pub gas_price: Option<WeiAmount>,
}

impl TxRequest {
	pub fn call(chain_id: u64, to: Address, data: Bytes, gas_limit: u64) -> Self {
		Self {
			chain_id,
			to: Some(to),
			value: WeiAmount::ZERO,
			data,
			gas_limit,
			gas_price: None,
		}
	}

	pub fn with_gas_price(mut self, gas_price: WeiAmount) -> Self {
		self.gas_price = Some(gas_price);
		self
	}

	/// Most the sender can be charged: `gas_limit * gas_price + value`.
	/// `None` when that does not fit in 256 bits.
	pub fn max_cost(&self) -> Option<WeiAmount> {
		self.gas_price
			.unwrap_or_default()
			.checked_mul(self.gas_limit)?
			.checked_add(self.value)
	}
}

/// Raw signed transaction plus the fields it was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
	pub raw: Bytes,
	pub hash: TxHash,
	pub nonce: u64,
	pub from: Address,
}

/// Lifecycle state of a pending transaction.
///
/// `Created -> Submitted -> (Confirmed | Dropped | Replaced)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingTxState {
	/// A nonce has been assigned and the transaction signed.
	Created,
	/// The node accepted the transaction.
	Submitted,
	/// A receipt was observed at the required depth.
	Confirmed,
	/// Submission or tracking was abandoned.
	Dropped,
	/// Superseded by another transaction for the same nonce.
	Replaced,
}

impl PendingTxState {
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			PendingTxState::Confirmed | PendingTxState::Dropped | PendingTxState::Replaced
		)
	}
}

/// A transaction tracked by the manager from nonce assignment to finality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTx {
	pub nonce: u64,
	pub request: TxRequest,
	pub signed: SignedTransaction,
	/// Unix timestamp of the last successful submission.
	pub submitted_at: Option<u64>,
	/// Number of send attempts made for this transaction.
	pub attempts: u32,
	pub state: PendingTxState,
}

impl PendingTx {
	pub fn new(request: TxRequest, signed: SignedTransaction) -> Self {
		Self {
			nonce: signed.nonce,
			request,
			signed,
			submitted_at: None,
			attempts: 0,
			state: PendingTxState::Created,
		}
	}

	pub fn hash(&self) -> TxHash {
		self.signed.hash
	}

	pub fn sender(&self) -> Address {
		self.signed.from
	}
}

/// Reason the chain node refused a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionCause {
	/// The nonce was already used; retryable with a refreshed nonce.
	NonceTooLow,
	/// A transaction with the same nonce is pending at a higher fee.
	ReplacementUnderpriced,
	/// The sender cannot pay for gas and value.
	InsufficientFunds,
	/// The exact transaction is already in the node's pool.
	AlreadyKnown,
	/// Any other refusal.
	Other,
}

impl RejectionCause {
	/// Classifies a node error message.
	///
	/// Clients word these differently, so matching is done on lowercase
	/// fragments shared by geth, erigon, nethermind and besu.
	pub fn classify(message: &str) -> Self {
		let message = message.to_lowercase();
		if message.contains("nonce too low")
			|| message.contains("nonce is too low")
			|| message.contains("oldnonce")
			|| message.contains("invalid nonce")
		{
			RejectionCause::NonceTooLow
		} else if message.contains("replacement transaction underpriced")
			|| message.contains("replacement underpriced")
			|| message.contains("replacedtransaction")
		{
			RejectionCause::ReplacementUnderpriced
		} else if message.contains("insufficient funds") {
			RejectionCause::InsufficientFunds
		} else if message.contains("already known")
			|| message.contains("known transaction")
			|| message.contains("alreadyknown")
		{
			RejectionCause::AlreadyKnown
		} else {
			RejectionCause::Other
		}
	}
}

impl fmt::Display for RejectionCause {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let text = match self {
			RejectionCause::NonceTooLow => "nonce too low",
			RejectionCause::ReplacementUnderpriced => "replacement underpriced",
			RejectionCause::InsufficientFunds => "insufficient funds",
			RejectionCause::AlreadyKnown => "already known",
			RejectionCause::Other => "rejected",
		};
		f.write_str(text)
	}
}

/// Why a transaction was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropCause {
	/// Transport failures persisted through every allowed attempt.
	RetriesExhausted { attempts: u32, last_error: String },
	/// The node still reported a stale nonce after one refresh.
	NonceTooLow { message: String },
	/// No receipt appeared within the configured number of head advances.
	Stuck { heads: u32 },
	/// The node returned a response that could not be decoded.
	Protocol { message: String },
}

impl fmt::Display for DropCause {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DropCause::RetriesExhausted {
				attempts,
				last_error,
			} => write!(f, "gave up after {} attempts: {}", attempts, last_error),
			DropCause::NonceTooLow { message } => {
				write!(f, "nonce too low after refresh: {}", message)
			}
			DropCause::Stuck { heads } => write!(f, "no receipt after {} new heads", heads),
			DropCause::Protocol { message } => write!(f, "protocol error: {}", message),
		}
	}
}

/// Outcome notification delivered to registered consumers.
///
/// Successful confirmations and failures share this path so consumers can
/// decide whether to retry at a higher level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxNotification {
	Confirmed {
		sender: Address,
		nonce: u64,
		hash: TxHash,
		receipt: TxReceipt,
	},
	Dropped {
		sender: Address,
		nonce: u64,
		hash: Option<TxHash>,
		cause: DropCause,
	},
	Rejected {
		sender: Address,
		nonce: u64,
		cause: RejectionCause,
		message: String,
	},
}

impl TxNotification {
	pub fn sender(&self) -> Address {
		match self {
			TxNotification::Confirmed { sender, .. }
			| TxNotification::Dropped { sender, .. }
			| TxNotification::Rejected { sender, .. } => *sender,
		}
	}

	pub fn nonce(&self) -> u64 {
		match self {
			TxNotification::Confirmed { nonce, .. }
			| TxNotification::Dropped { nonce, .. }
			| TxNotification::Rejected { nonce, .. } => *nonce,
		}
	}
}

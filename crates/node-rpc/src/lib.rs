//! Chain protocol client for the oracle node.
//!
//! This module isolates every other component from the JSON-RPC wire format.
//! A [`Transport`] moves raw JSON-RPC requests and push notifications (the
//! production one is an alloy provider); the
//! [`ProtocolClient`] on top of it exposes one typed operation per chain
//! interaction and hands out [`Subscription`] handles for push streams.

use async_trait::async_trait;
use node_types::{Address, ChainDataError, QuantityError, RejectionCause};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

mod client;
mod subscription;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::ProtocolClient;
pub use subscription::{Subscription, SubscriptionStream};

/// Re-export implementations
pub mod implementations {
	pub mod alloy;
}

/// Errors surfaced by the protocol client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
	/// Connectivity loss or timeout; generally retryable.
	#[error("Transport error: {0}")]
	Transport(String),
	/// The node answered with something that does not decode.
	#[error("Decode error: {0}")]
	Decode(String),
	/// The node refused a raw transaction.
	#[error("Submission rejected ({cause}): {message}")]
	SubmissionRejected {
		cause: RejectionCause,
		message: String,
	},
	/// An `eth_call` target failed to execute the call, typically because
	/// there is no contract code at the address.
	#[error("Invalid call target {target}: {message}")]
	InvalidCallTarget { target: Address, message: String },
	/// Any other JSON-RPC error object.
	#[error("RPC error {code}: {message}")]
	Rpc { code: i64, message: String },
	/// A log filter the node cannot express.
	#[error("Invalid filter: {0}")]
	InvalidFilter(String),
	/// A queried object does not exist.
	#[error("Not found: {0}")]
	NotFound(String),
	/// The transport cannot perform the operation (e.g. push over HTTP).
	#[error("Unsupported by transport: {0}")]
	Unsupported(String),
}

impl ClientError {
	/// Whether retrying the same call may succeed.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ClientError::Transport(_))
	}
}

impl From<ChainDataError> for ClientError {
	fn from(err: ChainDataError) -> Self {
		match err {
			ChainDataError::TooManyTopics(_) => ClientError::InvalidFilter(err.to_string()),
			ChainDataError::UnminedReceipt(_) => ClientError::Decode(err.to_string()),
		}
	}
}

impl From<QuantityError> for ClientError {
	fn from(err: QuantityError) -> Self {
		ClientError::Decode(err.to_string())
	}
}

/// A push registration as seen by the transport.
///
/// `notifications` ends when the registration is removed or the connection
/// drops; in the latter case `failure` holds the reason.
pub struct RawSubscription {
	pub id: String,
	pub notifications: mpsc::UnboundedReceiver<Value>,
	pub failure: watch::Receiver<Option<String>>,
}

/// Trait defining the interface for JSON-RPC transports.
///
/// Implementations carry requests to the chain node and deliver push
/// notifications. Only the protocol client calls these methods directly.
#[async_trait]
pub trait Transport: Send + Sync {
	/// Sends one request and returns its `result` (which may be `null`).
	async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError>;

	/// Whether [`Transport::subscribe`] is available.
	fn supports_subscriptions(&self) -> bool {
		false
	}

	/// Registers an `eth_subscribe` subscription.
	async fn subscribe(&self, _params: Value) -> Result<RawSubscription, ClientError> {
		Err(ClientError::Unsupported("eth_subscribe".to_string()))
	}

	/// Removes a subscription registration.
	async fn unsubscribe(&self, _id: &str) -> Result<(), ClientError> {
		Err(ClientError::Unsupported("eth_unsubscribe".to_string()))
	}

	/// Releases the underlying connection.
	async fn close(&self) {}
}

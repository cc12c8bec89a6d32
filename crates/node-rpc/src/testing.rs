//! Scriptable in-memory transport for tests.

use crate::{ClientError, RawSubscription, Transport};
use async_trait::async_trait;
use node_types::{Address, TxHash, B256};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};

type Handler = Box<dyn FnMut(&Value) -> Result<Value, ClientError> + Send>;

/// Transport whose responses come from per-method handlers.
///
/// Calls to methods without a handler fail with JSON-RPC `-32601`.
pub struct MockTransport {
	handlers: Mutex<HashMap<String, Handler>>,
	calls: Mutex<Vec<(String, Value)>>,
	subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
	unsubscribed: Mutex<Vec<String>>,
	failure: watch::Sender<Option<String>>,
	next_subscription: AtomicU64,
	push: bool,
}

impl Default for MockTransport {
	fn default() -> Self {
		Self::new()
	}
}

impl MockTransport {
	pub fn new() -> Self {
		let (failure, _) = watch::channel(None);
		Self {
			handlers: Mutex::new(HashMap::new()),
			calls: Mutex::new(Vec::new()),
			subscriptions: Mutex::new(HashMap::new()),
			unsubscribed: Mutex::new(Vec::new()),
			failure,
			next_subscription: AtomicU64::new(1),
			push: true,
		}
	}

	/// A transport that behaves like HTTP: no push support.
	pub fn without_subscriptions() -> Self {
		Self {
			push: false,
			..Self::new()
		}
	}

	/// Installs the handler for `method`, replacing any previous one.
	pub fn on<F>(&self, method: &str, handler: F)
	where
		F: FnMut(&Value) -> Result<Value, ClientError> + Send + 'static,
	{
		self.handlers
			.lock()
			.unwrap()
			.insert(method.to_string(), Box::new(handler));
	}

	/// Installs a handler that always returns `result`.
	pub fn respond(&self, method: &str, result: Value) {
		self.on(method, move |_| Ok(result.clone()));
	}

	/// Parameters of every call to `method`, in call order.
	pub fn calls(&self, method: &str) -> Vec<Value> {
		self.calls
			.lock()
			.unwrap()
			.iter()
			.filter(|(m, _)| m == method)
			.map(|(_, params)| params.clone())
			.collect()
	}

	/// Pushes a notification to subscription `id`. Returns `false` when no
	/// such registration is live.
	pub fn push(&self, id: &str, value: Value) -> bool {
		match self.subscriptions.lock().unwrap().get(id) {
			Some(sink) => sink.send(value).is_ok(),
			None => false,
		}
	}

	/// Ids of live registrations.
	pub fn active_subscriptions(&self) -> Vec<String> {
		let mut ids: Vec<_> = self.subscriptions.lock().unwrap().keys().cloned().collect();
		ids.sort();
		ids
	}

	/// Ids passed to `unsubscribe`, in call order.
	pub fn unsubscribed(&self) -> Vec<String> {
		self.unsubscribed.lock().unwrap().clone()
	}

	/// Simulates a dropped connection.
	pub fn fail(&self, reason: &str) {
		self.failure.send_replace(Some(reason.to_string()));
		self.subscriptions.lock().unwrap().clear();
	}
}

#[async_trait]
impl Transport for MockTransport {
	async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
		self.calls
			.lock()
			.unwrap()
			.push((method.to_string(), params.clone()));
		if let Some(reason) = self.failure.borrow().clone() {
			return Err(ClientError::Transport(reason));
		}
		match self.handlers.lock().unwrap().get_mut(method) {
			Some(handler) => handler(&params),
			None => Err(ClientError::Rpc {
				code: -32601,
				message: format!("the method {} does not exist", method),
			}),
		}
	}

	fn supports_subscriptions(&self) -> bool {
		self.push
	}

	async fn subscribe(&self, params: Value) -> Result<RawSubscription, ClientError> {
		if !self.push {
			return Err(ClientError::Unsupported("eth_subscribe".to_string()));
		}
		self.calls
			.lock()
			.unwrap()
			.push(("eth_subscribe".to_string(), params));

		let id = format!("0x{:x}", self.next_subscription.fetch_add(1, Ordering::Relaxed));
		let (sink, notifications) = mpsc::unbounded_channel();
		self.subscriptions.lock().unwrap().insert(id.clone(), sink);

		Ok(RawSubscription {
			id,
			notifications,
			failure: self.failure.subscribe(),
		})
	}

	async fn unsubscribe(&self, id: &str) -> Result<(), ClientError> {
		self.unsubscribed.lock().unwrap().push(id.to_string());
		self.subscriptions.lock().unwrap().remove(id);
		Ok(())
	}
}

fn empty_bloom() -> String {
	format!("0x{}", "0".repeat(512))
}

/// Hash used for block `number` by [`header_json`].
pub fn block_hash(number: u64) -> B256 {
	B256::left_padding_from(&number.to_be_bytes())
}

/// A block as returned by `eth_getBlockByNumber` or pushed on `newHeads`.
///
/// Blocks chain by hash and carry timestamp `1_700_000_000 + number`.
pub fn header_json(number: u64) -> Value {
	json!({
		"hash": block_hash(number),
		"parentHash": block_hash(number.saturating_sub(1)),
		"sha3Uncles": B256::ZERO,
		"miner": Address::ZERO,
		"stateRoot": B256::ZERO,
		"transactionsRoot": B256::ZERO,
		"receiptsRoot": B256::ZERO,
		"logsBloom": empty_bloom(),
		"difficulty": "0x0",
		"number": format!("0x{:x}", number),
		"gasLimit": "0x1c9c380",
		"gasUsed": "0x0",
		"timestamp": format!("0x{:x}", 1_700_000_000 + number),
		"extraData": "0x",
		"mixHash": B256::ZERO,
		"nonce": "0x0000000000000000",
		"baseFeePerGas": "0x7",
		"size": "0x220",
		"uncles": [],
		"transactions": []
	})
}

/// Receipt of `hash` mined in block `block`.
pub fn receipt_json(hash: TxHash, block: u64, success: bool) -> Value {
	json!({
		"type": "0x2",
		"status": if success { "0x1" } else { "0x0" },
		"cumulativeGasUsed": "0x5208",
		"logs": [],
		"logsBloom": empty_bloom(),
		"transactionHash": hash,
		"transactionIndex": "0x0",
		"blockHash": block_hash(block),
		"blockNumber": format!("0x{:x}", block),
		"gasUsed": "0x5208",
		"effectiveGasPrice": "0x3b9aca00",
		"blobGasUsed": null,
		"blobGasPrice": null,
		"from": Address::repeat_byte(0xaa),
		"to": Address::repeat_byte(0xbb),
		"contractAddress": null
	})
}

/// A log emitted by `address` in block `block`, with one topic and no data.
pub fn log_json(address: Address, block: u64) -> Value {
	json!({
		"address": address,
		"topics": [B256::repeat_byte(0x01)],
		"data": "0x",
		"blockHash": block_hash(block),
		"blockNumber": format!("0x{:x}", block),
		"blockTimestamp": null,
		"transactionHash": B256::repeat_byte(0x02),
		"transactionIndex": "0x0",
		"logIndex": "0x0",
		"removed": false
	})
}

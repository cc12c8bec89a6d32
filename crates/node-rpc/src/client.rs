//! Typed protocol client.

use crate::implementations::alloy::AlloyTransport;
use crate::subscription::{lock_registry, Decoder, Registry, Subscription, SubscriptionStream};
use crate::{ClientError, Transport};
use alloy_rpc_types::{Header, Log, TransactionReceipt};
use alloy_sol_types::SolCall;
use node_config::TransportConfig;
use node_types::call::erc20::balanceOfCall;
use node_types::quantity::decode_u64;
use node_types::{
	Address, BlockHeader, BlockTag, Bytes, CallPayload, EthBalance, LogEvent, LogFilter,
	RejectionCause, SignedTransaction, TxHash, TxReceipt, WeiAmount,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Client for one chain node.
///
/// Constructed explicitly and passed to the components that need it. Every
/// operation is typed; the generic JSON-RPC invoke stays private.
/// [`ProtocolClient::shutdown`] releases every live subscription and the
/// transport.
pub struct ProtocolClient {
	transport: Arc<dyn Transport>,
	subscriptions: Registry,
}

impl ProtocolClient {
	pub fn new(transport: Arc<dyn Transport>) -> Self {
		Self {
			transport,
			subscriptions: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Opens the configured transport. The WebSocket endpoint is preferred
	/// when present because it carries push subscriptions.
	pub async fn connect(config: &TransportConfig) -> Result<Self, ClientError> {
		let url = config.ws_url.as_deref().unwrap_or(&config.http_url);
		let transport: Arc<dyn Transport> =
			Arc::new(AlloyTransport::connect(url, config.request_timeout()).await?);
		tracing::info!(
			push = transport.supports_subscriptions(),
			"Protocol client ready"
		);
		Ok(Self::new(transport))
	}

	/// Whether push subscriptions are available.
	pub fn supports_subscriptions(&self) -> bool {
		self.transport.supports_subscriptions()
	}

	async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ClientError> {
		let result = self.transport.request(method, params).await?;
		serde_json::from_value(result)
			.map_err(|e| ClientError::Decode(format!("Malformed {} result: {}", method, e)))
	}

	async fn call_u64(&self, method: &str, params: Value) -> Result<u64, ClientError> {
		let result: String = self.call(method, params).await?;
		Ok(decode_u64(&result)?)
	}

	/// Next nonce for `address`, counting transactions in the node's pool.
	pub async fn get_nonce(&self, address: Address) -> Result<u64, ClientError> {
		self.call_u64("eth_getTransactionCount", json!([address, BlockTag::Pending]))
			.await
	}

	pub async fn get_wei_balance(&self, address: Address) -> Result<WeiAmount, ClientError> {
		self.call("eth_getBalance", json!([address, BlockTag::Latest]))
			.await
	}

	pub async fn get_eth_balance(&self, address: Address) -> Result<EthBalance, ClientError> {
		self.get_wei_balance(address).await.map(EthBalance::new)
	}

	/// ERC-20 balance of `holder` at `contract`.
	///
	/// Fails with [`ClientError::InvalidCallTarget`] when the node cannot
	/// execute the call, or returns nothing, as happens for an address
	/// without contract code.
	pub async fn get_erc20_balance(
		&self,
		holder: Address,
		contract: Address,
	) -> Result<WeiAmount, ClientError> {
		let payload = CallPayload::BalanceOf { holder };
		let data = match self.eth_call(contract, &payload).await {
			Ok(data) => data,
			Err(ClientError::Rpc { message, .. }) => {
				return Err(ClientError::InvalidCallTarget {
					target: contract,
					message,
				})
			}
			Err(e) => return Err(e),
		};

		if data.is_empty() {
			return Err(ClientError::InvalidCallTarget {
				target: contract,
				message: "call returned no data".to_string(),
			});
		}
		let decoded = balanceOfCall::abi_decode_returns(&data, true)
			.map_err(|e| ClientError::Decode(format!("Malformed balanceOf result: {}", e)))?;
		Ok(WeiAmount::new(decoded.balance))
	}

	async fn eth_call(&self, to: Address, payload: &CallPayload) -> Result<Bytes, ClientError> {
		self.call(
			"eth_call",
			json!([{ "to": to, "data": payload.encode() }, BlockTag::Latest]),
		)
		.await
	}

	/// Broadcasts a signed transaction.
	///
	/// Node refusals are classified into
	/// [`ClientError::SubmissionRejected`]; deciding what to do with each
	/// cause, including `AlreadyKnown`, is up to the caller.
	pub async fn send_raw_transaction(
		&self,
		signed: &SignedTransaction,
	) -> Result<TxHash, ClientError> {
		let hash: TxHash = match self
			.call("eth_sendRawTransaction", json!([signed.raw]))
			.await
		{
			Ok(hash) => hash,
			Err(ClientError::Rpc { message, .. }) => {
				let cause = RejectionCause::classify(&message);
				tracing::debug!(
					hash = %signed.hash,
					nonce = signed.nonce,
					%cause,
					"Transaction rejected by node"
				);
				return Err(ClientError::SubmissionRejected { cause, message });
			}
			Err(e) => return Err(e),
		};

		if hash != signed.hash {
			tracing::warn!(
				expected = %signed.hash,
				reported = %hash,
				"Node reported a different transaction hash"
			);
		}
		Ok(hash)
	}

	/// Receipt of a mined transaction; `None` while it is pending or unknown.
	pub async fn get_transaction_receipt(
		&self,
		hash: TxHash,
	) -> Result<Option<TxReceipt>, ClientError> {
		let receipt: Option<TransactionReceipt> =
			self.call("eth_getTransactionReceipt", json!([hash])).await?;
		receipt.map(decode_receipt).transpose()
	}

	pub async fn get_block_number(&self) -> Result<u64, ClientError> {
		self.call_u64("eth_blockNumber", json!([])).await
	}

	pub async fn get_block_by_number(&self, tag: BlockTag) -> Result<BlockHeader, ClientError> {
		let header: Option<Header> = self
			.call("eth_getBlockByNumber", json!([tag, false]))
			.await?;
		header
			.map(BlockHeader::from)
			.ok_or_else(|| ClientError::NotFound(format!("block {}", tag)))
	}

	pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<LogEvent>, ClientError> {
		let logs: Vec<Log> = self.call("eth_getLogs", json!([filter.to_rpc()?])).await?;
		Ok(logs.into_iter().map(LogEvent::from).collect())
	}

	pub async fn get_chain_id(&self) -> Result<u64, ClientError> {
		self.call_u64("eth_chainId", json!([])).await
	}

	pub async fn get_gas_price(&self) -> Result<WeiAmount, ClientError> {
		self.call("eth_gasPrice", json!([])).await
	}

	/// Subscribes to new block headers.
	pub async fn subscribe_new_heads(
		&self,
	) -> Result<(Subscription, SubscriptionStream<BlockHeader>), ClientError> {
		self.subscribe(json!(["newHeads"]), decode_header).await
	}

	/// Subscribes to logs matching `filter`.
	pub async fn subscribe_logs(
		&self,
		filter: &LogFilter,
	) -> Result<(Subscription, SubscriptionStream<LogEvent>), ClientError> {
		self.subscribe(json!(["logs", filter.to_rpc()?]), decode_log)
			.await
	}

	async fn subscribe<T>(
		&self,
		params: Value,
		decode: Decoder<T>,
	) -> Result<(Subscription, SubscriptionStream<T>), ClientError> {
		let raw = self.transport.subscribe(params).await?;
		tracing::debug!(subscription = %raw.id, "Subscribed");
		Ok(Subscription::register(
			raw,
			decode,
			self.transport.clone(),
			self.subscriptions.clone(),
		))
	}

	/// Closes every live subscription, then the transport.
	pub async fn shutdown(&self) {
		let live: Vec<_> = lock_registry(&self.subscriptions)
			.drain()
			.map(|(_, state)| state)
			.collect();

		for state in live {
			if state.mark_closed() {
				if let Err(e) = self.transport.unsubscribe(state.id()).await {
					tracing::debug!(subscription = %state.id(), error = %e, "Unsubscribe failed");
				}
			}
		}
		self.transport.close().await;
		tracing::info!("Protocol client shut down");
	}
}

fn decode_receipt(receipt: TransactionReceipt) -> Result<TxReceipt, ClientError> {
	Ok(TxReceipt::try_from(receipt)?)
}

fn decode_header(value: Value) -> Result<BlockHeader, ClientError> {
	serde_json::from_value::<Header>(value)
		.map(BlockHeader::from)
		.map_err(|e| ClientError::Decode(format!("Malformed header: {}", e)))
}

fn decode_log(value: Value) -> Result<LogEvent, ClientError> {
	serde_json::from_value::<Log>(value)
		.map(LogEvent::from)
		.map_err(|e| ClientError::Decode(format!("Malformed log: {}", e)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{block_hash, header_json, log_json, receipt_json, MockTransport};
	use futures::StreamExt;
	use node_types::{FunctionSelector, TxStatus, B256};

	fn client() -> (Arc<MockTransport>, ProtocolClient) {
		let transport = Arc::new(MockTransport::new());
		let client = ProtocolClient::new(transport.clone());
		(transport, client)
	}

	fn header(number: u64) -> BlockHeader {
		BlockHeader {
			number,
			hash: block_hash(number),
			parent_hash: block_hash(number - 1),
			timestamp: 1_700_000_000 + number,
		}
	}

	#[tokio::test]
	async fn test_get_nonce_uses_pending_tag() {
		let (transport, client) = client();
		transport.respond("eth_getTransactionCount", json!("0x5"));

		let address = Address::repeat_byte(0xaa);
		assert_eq!(client.get_nonce(address).await.unwrap(), 5);

		let calls = transport.calls("eth_getTransactionCount");
		assert_eq!(calls, vec![json!([address, "pending"])]);
	}

	#[tokio::test]
	async fn test_quantities_decode_strictly() {
		let (transport, client) = client();
		let address = Address::repeat_byte(0xaa);

		transport.respond("eth_getBalance", json!("0x"));
		assert!(matches!(
			client.get_wei_balance(address).await,
			Err(ClientError::Decode(_))
		));

		transport.respond("eth_blockNumber", json!("10"));
		assert!(matches!(
			client.get_block_number().await,
			Err(ClientError::Decode(_))
		));

		transport.respond("eth_getBalance", json!("0xde0b6b3a7640000"));
		let balance = client.get_eth_balance(address).await.unwrap();
		assert_eq!(balance.as_wei(), WeiAmount::from(1_000_000_000_000_000_000u64));
	}

	#[tokio::test]
	async fn test_erc20_payload_ends_with_holder() {
		let (transport, client) = client();
		let mut result = [0u8; 32];
		result[31] = 100;
		transport.respond("eth_call", json!(Bytes::from(result.to_vec())));

		// Leading zero bytes must survive padding
		let holder: Address = "0x0000000000000000000000000000000000c0ffee".parse().unwrap();
		let contract = Address::repeat_byte(0x77);
		let balance = client.get_erc20_balance(holder, contract).await.unwrap();
		assert_eq!(balance, WeiAmount::from(100u64));

		let calls = transport.calls("eth_call");
		assert_eq!(calls.len(), 1);
		let data: Bytes = serde_json::from_value(calls[0][0]["data"].clone()).unwrap();
		assert_eq!(data.len(), 36);
		assert_eq!(&data[..4], FunctionSelector::BALANCE_OF.as_bytes());
		assert_eq!(&data[data.len() - 20..], holder.as_slice());
		assert_eq!(calls[0][1], json!("latest"));
	}

	#[tokio::test]
	async fn test_erc20_invalid_target() {
		let (transport, client) = client();
		let holder = Address::repeat_byte(0x01);
		let contract = Address::repeat_byte(0x02);

		transport.respond("eth_call", json!("0x"));
		assert!(matches!(
			client.get_erc20_balance(holder, contract).await,
			Err(ClientError::InvalidCallTarget { target, .. }) if target == contract
		));

		transport.on("eth_call", |_| {
			Err(ClientError::Rpc {
				code: 3,
				message: "execution reverted".to_string(),
			})
		});
		assert!(matches!(
			client.get_erc20_balance(holder, contract).await,
			Err(ClientError::InvalidCallTarget { .. })
		));

		// A short word is a malformed answer, not a bad target
		transport.respond("eth_call", json!("0x0000"));
		assert!(matches!(
			client.get_erc20_balance(holder, contract).await,
			Err(ClientError::Decode(_))
		));

		// Transport failures are not reclassified
		transport.on("eth_call", |_| Err(ClientError::Transport("down".to_string())));
		assert!(matches!(
			client.get_erc20_balance(holder, contract).await,
			Err(ClientError::Transport(_))
		));
	}

	#[tokio::test]
	async fn test_send_raw_transaction_classifies_rejections() {
		let (transport, client) = client();
		let signed = SignedTransaction {
			raw: Bytes::from_static(&[0xf8, 0x01]),
			hash: B256::repeat_byte(0x42),
			nonce: 3,
			from: Address::repeat_byte(0xaa),
		};

		transport.respond("eth_sendRawTransaction", json!(signed.hash));
		assert_eq!(client.send_raw_transaction(&signed).await.unwrap(), signed.hash);
		assert_eq!(transport.calls("eth_sendRawTransaction")[0], json!(["0xf801"]));

		transport.on("eth_sendRawTransaction", |_| {
			Err(ClientError::Rpc {
				code: -32000,
				message: "nonce too low: next nonce 4, tx nonce 3".to_string(),
			})
		});
		match client.send_raw_transaction(&signed).await {
			Err(ClientError::SubmissionRejected { cause, .. }) => {
				assert_eq!(cause, RejectionCause::NonceTooLow)
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_null_results() {
		let (transport, client) = client();
		transport.respond("eth_getTransactionReceipt", Value::Null);
		transport.respond("eth_getBlockByNumber", Value::Null);

		assert_eq!(
			client
				.get_transaction_receipt(B256::repeat_byte(1))
				.await
				.unwrap(),
			None
		);
		assert!(matches!(
			client.get_block_by_number(BlockTag::Number(99)).await,
			Err(ClientError::NotFound(_))
		));
		assert_eq!(
			transport.calls("eth_getBlockByNumber")[0],
			json!(["0x63", false])
		);
	}

	#[tokio::test]
	async fn test_receipt_and_block_decode() {
		let (transport, client) = client();
		let hash = B256::repeat_byte(0x42);
		transport.respond("eth_getTransactionReceipt", receipt_json(hash, 10, false));
		transport.respond("eth_getBlockByNumber", header_json(12));

		let receipt = client.get_transaction_receipt(hash).await.unwrap().unwrap();
		assert_eq!(receipt.transaction_hash, hash);
		assert_eq!(receipt.status, TxStatus::Failure);
		assert_eq!(receipt.block_number, 10);
		assert_eq!(receipt.block_hash, block_hash(10));

		let head = client.get_block_by_number(BlockTag::Latest).await.unwrap();
		assert_eq!(head, header(12));

		// A receipt without block context cannot be tracked
		let mut unmined = receipt_json(hash, 10, true);
		unmined["blockNumber"] = Value::Null;
		unmined["blockHash"] = Value::Null;
		transport.respond("eth_getTransactionReceipt", unmined);
		assert!(matches!(
			client.get_transaction_receipt(hash).await,
			Err(ClientError::Decode(_))
		));
	}

	#[tokio::test]
	async fn test_get_logs_sends_filter_object() {
		let (transport, client) = client();
		let contract = Address::repeat_byte(0x10);
		transport.respond("eth_getLogs", json!([log_json(contract, 5), log_json(contract, 6)]));

		let filter = LogFilter::new()
			.address(contract)
			.topic(0, vec![B256::repeat_byte(0x01)])
			.from_block(5u64)
			.to_block(6u64);
		let logs = client.get_logs(&filter).await.unwrap();
		assert_eq!(logs.len(), 2);
		assert_eq!(logs[1].block_number, Some(6));
		assert!(logs.iter().all(|log| filter.matches(log)));

		let params = &transport.calls("eth_getLogs")[0][0];
		assert_eq!(params["address"], json!(contract));
		assert_eq!(params["fromBlock"], "0x5");
		assert_eq!(params["toBlock"], "0x6");
		assert_eq!(params["topics"][0], json!(B256::repeat_byte(0x01)));

		// Never reaches the node
		let wide = LogFilter::new().topic(4, vec![B256::ZERO]);
		assert!(matches!(
			client.get_logs(&wide).await,
			Err(ClientError::InvalidFilter(_))
		));
		assert_eq!(transport.calls("eth_getLogs").len(), 1);
	}

	#[tokio::test]
	async fn test_new_heads_subscription() {
		let (transport, client) = client();
		let (subscription, mut heads) = client.subscribe_new_heads().await.unwrap();
		assert_eq!(transport.calls("eth_subscribe"), vec![json!(["newHeads"])]);

		assert!(transport.push(subscription.id(), header_json(7)));
		assert!(transport.push(subscription.id(), header_json(8)));
		assert_eq!(heads.next().await, Some(header(7)));
		assert_eq!(heads.next().await, Some(header(8)));

		subscription.close().await.unwrap();
		subscription.close().await.unwrap();
		assert_eq!(heads.next().await, None);
		assert!(subscription.failure().is_none());

		// Dropping a closed handle does not unsubscribe again
		let id = subscription.id().to_string();
		drop(subscription);
		assert_eq!(transport.unsubscribed(), vec![id]);
	}

	#[tokio::test]
	async fn test_undecodable_push_ends_stream() {
		let (transport, client) = client();
		let (subscription, mut heads) = client.subscribe_new_heads().await.unwrap();

		transport.push(subscription.id(), json!({"number": "not hex"}));
		assert_eq!(heads.next().await, None);
		assert!(matches!(subscription.failure(), Some(ClientError::Decode(_))));
	}

	#[tokio::test]
	async fn test_transport_failure_ends_stream() {
		let (transport, client) = client();
		let filter = LogFilter::new().address(Address::repeat_byte(0x10));
		let (subscription, mut logs) = client.subscribe_logs(&filter).await.unwrap();
		assert_eq!(
			transport.calls("eth_subscribe")[0][1]["address"],
			json!(Address::repeat_byte(0x10))
		);

		transport.fail("connection reset");
		assert_eq!(logs.next().await, None);
		assert!(matches!(subscription.failure(), Some(ClientError::Transport(_))));

		// Nothing to release on a dead connection
		subscription.close().await.unwrap();
		assert!(transport.unsubscribed().is_empty());
	}

	#[tokio::test]
	async fn test_shutdown_closes_live_subscriptions() {
		let (transport, client) = client();
		let (first, mut first_stream) = client.subscribe_new_heads().await.unwrap();
		let (second, _second_stream) = client
			.subscribe_logs(&LogFilter::new())
			.await
			.unwrap();
		assert_eq!(transport.active_subscriptions().len(), 2);

		client.shutdown().await;
		assert!(first.is_closed());
		assert!(second.is_closed());
		assert!(transport.active_subscriptions().is_empty());
		assert_eq!(first_stream.next().await, None);

		// Handles closed by shutdown are not released twice
		first.close().await.unwrap();
		drop(second);
		assert_eq!(transport.unsubscribed().len(), 2);
	}

	#[tokio::test]
	async fn test_subscribe_without_push_support() {
		let client = ProtocolClient::new(Arc::new(MockTransport::without_subscriptions()));
		assert!(!client.supports_subscriptions());
		assert!(matches!(
			client.subscribe_new_heads().await,
			Err(ClientError::Unsupported(_))
		));
	}
}

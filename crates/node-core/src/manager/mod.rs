//! Transaction manager.
//!
//! The manager is the only source of outbound nonces for the senders it
//! manages. Nonce reservation, signing and submission for one sender happen
//! inside that sender's critical section, so concurrent submissions for the
//! same sender are strictly ordered while different senders proceed
//! independently. Confirmation tracking is driven by new heads (see
//! [`TransactionManager::on_new_head`]) and every terminal outcome is
//! reported to the registered [`TransactionConsumer`]s.

mod tracking;

use crate::state::pending::{transition, PendingTxStore};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use dashmap::DashMap;
use node_account::{SignerError, TransactionSigner};
use node_config::TransactionsConfig;
use node_rpc::{ClientError, ProtocolClient};
use node_types::{
	current_timestamp, truncate_id, Address, DropCause, PendingTx, PendingTxState,
	RejectionCause, TxHash, TxNotification, TxReceipt, TxRequest,
};
use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Settled outcomes kept per sender for late `confirm` calls.
const SETTLED_HISTORY: usize = 256;

/// Errors that can occur during transaction management.
#[derive(Debug, Error)]
pub enum TxmError {
	#[error("Client error: {0}")]
	Client(#[from] ClientError),
	#[error("Signing error: {0}")]
	Signing(#[from] SignerError),
	/// The node refused the transaction; not retried automatically.
	#[error("Transaction rejected ({cause}): {message}")]
	Rejected {
		cause: RejectionCause,
		message: String,
	},
	#[error("Transaction with nonce {nonce} dropped: {cause}")]
	Dropped { nonce: u64, cause: DropCause },
	/// No receipt within the stuck window and the policy abandoned it.
	#[error("Transaction {hash} stuck after {heads} heads without a receipt")]
	Stuck { hash: TxHash, heads: u32 },
	/// Cancelled before the transaction reached the node; the nonce
	/// reservation was rolled back.
	#[error("Cancelled before submission")]
	Cancelled,
	/// Local tracking stopped; the transaction may still be mined.
	#[error("Tracking cancelled, transaction {hash} may still be mined")]
	TrackingCancelled { hash: TxHash },
	#[error("Unknown transaction {nonce} for sender {sender}")]
	UnknownTransaction { sender: Address, nonce: u64 },
	#[error("Storage error: {0}")]
	Storage(String),
}

/// Receives terminal transaction outcomes.
#[async_trait]
pub trait TransactionConsumer: Send + Sync {
	async fn on_notification(&self, notification: &TxNotification);
}

/// Identifies a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingTxHandle {
	pub sender: Address,
	pub nonce: u64,
	/// Hash of the first submission; fee bumps replace it on chain.
	pub hash: TxHash,
}

#[derive(Debug, Clone)]
pub(crate) enum WaitOutcome {
	Confirmed(TxReceipt),
	Dropped(DropCause),
}

impl WaitOutcome {
	fn into_result(self, handle: &PendingTxHandle) -> Result<TxReceipt, TxmError> {
		match self {
			WaitOutcome::Confirmed(receipt) => Ok(receipt),
			WaitOutcome::Dropped(DropCause::Stuck { heads }) => Err(TxmError::Stuck {
				hash: handle.hash,
				heads,
			}),
			WaitOutcome::Dropped(cause) => Err(TxmError::Dropped {
				nonce: handle.nonce,
				cause,
			}),
		}
	}
}

struct Waiter {
	depth: u64,
	respond: oneshot::Sender<WaitOutcome>,
}

/// An answer owed to a waiter, delivered once consumers have been told.
struct WaiterReply {
	respond: oneshot::Sender<WaitOutcome>,
	outcome: WaitOutcome,
}

impl WaiterReply {
	fn deliver(self) {
		let _ = self.respond.send(self.outcome);
	}
}

/// A nonce in flight, with every transaction sent for it.
struct TrackedSlot {
	tx: PendingTx,
	/// Earlier attempts superseded by fee bumps, oldest first.
	replaced: Vec<PendingTx>,
	/// Absent for records restored without a signer; those cannot be bumped.
	signer: Option<Arc<dyn TransactionSigner>>,
	receipt: Option<TxReceipt>,
	heads_without_receipt: u32,
	waiters: Vec<Waiter>,
}

impl TrackedSlot {
	fn new(tx: PendingTx, signer: Option<Arc<dyn TransactionSigner>>) -> Self {
		Self {
			tx,
			replaced: Vec::new(),
			signer,
			receipt: None,
			heads_without_receipt: 0,
			waiters: Vec::new(),
		}
	}

	/// Depth at which the slot counts as confirmed. A caller waiting for
	/// fewer blocks than configured lowers it.
	fn confirm_threshold(&self, configured: u64) -> u64 {
		self.waiters
			.iter()
			.map(|waiter| waiter.depth)
			.fold(configured, u64::min)
	}

	/// Removes the waiters satisfied at `depth`.
	fn take_ready(&mut self, depth: u64, receipt: &TxReceipt) -> Vec<WaiterReply> {
		let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
			.into_iter()
			.partition(|waiter| waiter.depth <= depth);
		self.waiters = waiting;
		ready
			.into_iter()
			.map(|waiter| WaiterReply {
				respond: waiter.respond,
				outcome: WaitOutcome::Confirmed(receipt.clone()),
			})
			.collect()
	}
}

/// Everything the manager knows about one sender.
#[derive(Default)]
struct SenderState {
	/// Next nonce to hand out; `None` means re-read it from the chain.
	next_nonce: Option<u64>,
	slots: BTreeMap<u64, TrackedSlot>,
	settled: BTreeMap<u64, WaitOutcome>,
	/// Set when the node refused a transaction for insufficient funds;
	/// cleared once a balance check shows the sender can pay again.
	unfunded: bool,
}

impl SenderState {
	/// First nonce at or above `chain_nonce` not held by a local slot.
	fn next_free(&self, chain_nonce: u64) -> u64 {
		match self.slots.keys().next_back() {
			Some(highest) => chain_nonce.max(highest + 1),
			None => chain_nonce,
		}
	}

	fn track(&mut self, slot: TrackedSlot) {
		self.settled.remove(&slot.tx.nonce);
		self.slots.insert(slot.tx.nonce, slot);
	}

	/// Retires the slot of `nonce`, returning the answers owed to its waiters.
	fn settle(&mut self, nonce: u64, outcome: WaitOutcome) -> Vec<WaiterReply> {
		let replies = match self.slots.remove(&nonce) {
			Some(slot) => slot
				.waiters
				.into_iter()
				.map(|waiter| WaiterReply {
					respond: waiter.respond,
					outcome: outcome.clone(),
				})
				.collect(),
			None => Vec::new(),
		};
		self.settled.insert(nonce, outcome);
		while self.settled.len() > SETTLED_HISTORY {
			self.settled.pop_first();
		}
		replies
	}

	fn live_records(&self) -> Vec<PendingTx> {
		self.slots
			.values()
			.filter(|slot| !slot.tx.state.is_terminal())
			.map(|slot| slot.tx.clone())
			.collect()
	}
}

/// A submission failure and the notification it owes consumers, if any.
struct SubmitFailure {
	error: TxmError,
	notification: Option<TxNotification>,
}

impl SubmitFailure {
	fn silent(error: TxmError) -> Self {
		Self {
			error,
			notification: None,
		}
	}

	fn reported(error: TxmError, notification: TxNotification) -> Self {
		Self {
			error,
			notification: Some(notification),
		}
	}

	fn dropped(sender: Address, nonce: u64, hash: Option<TxHash>, cause: DropCause) -> Self {
		Self::reported(
			TxmError::Dropped {
				nonce,
				cause: cause.clone(),
			},
			TxNotification::Dropped {
				sender,
				nonce,
				hash,
				cause,
			},
		)
	}
}

impl From<ClientError> for SubmitFailure {
	fn from(err: ClientError) -> Self {
		Self::silent(err.into())
	}
}

impl From<SignerError> for SubmitFailure {
	fn from(err: SignerError) -> Self {
		Self::silent(err.into())
	}
}

/// Applies a lifecycle transition the manager knows to be valid.
fn set_state(tx: &mut PendingTx, to: PendingTxState) {
	if let Err(e) = transition(tx, to) {
		tracing::error!(nonce = tx.nonce, error = %e, "Unexpected pending transaction transition");
	}
}

/// Nonce assignment, submission and confirmation tracking.
pub struct TransactionManager {
	client: Arc<ProtocolClient>,
	config: TransactionsConfig,
	senders: DashMap<Address, Arc<Mutex<SenderState>>>,
	consumers: RwLock<Vec<Arc<dyn TransactionConsumer>>>,
	store: Option<PendingTxStore>,
	/// Serializes head processing.
	head_gate: Mutex<()>,
	last_head: std::sync::Mutex<Option<u64>>,
}

impl TransactionManager {
	pub fn new(client: Arc<ProtocolClient>, config: TransactionsConfig) -> Self {
		Self {
			client,
			config,
			senders: DashMap::new(),
			consumers: RwLock::new(Vec::new()),
			store: None,
			head_gate: Mutex::new(()),
			last_head: std::sync::Mutex::new(None),
		}
	}

	/// Persists live records through `store` on every state change.
	pub fn with_store(mut self, store: PendingTxStore) -> Self {
		self.store = Some(store);
		self
	}

	/// Adds a consumer of transaction outcomes. Done once at startup.
	pub async fn register(&self, consumer: Arc<dyn TransactionConsumer>) {
		self.consumers.write().await.push(consumer);
	}

	fn sender_state(&self, sender: Address) -> Arc<Mutex<SenderState>> {
		self.senders.entry(sender).or_default().clone()
	}

	fn last_head_guard(&self) -> MutexGuard<'_, Option<u64>> {
		self.last_head.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Number of the last head processed.
	pub fn last_head(&self) -> Option<u64> {
		*self.last_head_guard()
	}

	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.config.backoff_initial())
			.with_max_interval(self.config.backoff_max())
			.with_max_elapsed_time(None)
			.build()
	}

	/// Reserves the next nonce for `sender`, signs `request` with `signer` and
	/// broadcasts it.
	///
	/// A missing gas price is filled from the node. The reservation is rolled
	/// back when signing fails, when the node rejects the transaction, or when
	/// `cancel` fires before the node accepted it.
	#[instrument(skip_all, fields(sender = %sender))]
	pub async fn submit(
		&self,
		sender: Address,
		request: TxRequest,
		signer: Arc<dyn TransactionSigner>,
		cancel: &CancellationToken,
	) -> Result<PendingTxHandle, TxmError> {
		if cancel.is_cancelled() {
			return Err(TxmError::Cancelled);
		}

		let request = match request.gas_price {
			Some(_) => request,
			None => {
				let price = self.client.get_gas_price().await?;
				request.with_gas_price(price)
			}
		};

		let state = self.sender_state(sender);
		let mut guard = tokio::select! {
			biased;
			_ = cancel.cancelled() => return Err(TxmError::Cancelled),
			guard = state.lock() => guard,
		};

		let result = self
			.submit_locked(sender, &mut guard, request, signer, cancel)
			.await;
		if result.is_ok() {
			self.persist(sender, &guard).await;
		}
		drop(guard);

		match result {
			Ok(handle) => Ok(handle),
			Err(failure) => {
				if let Some(notification) = failure.notification {
					self.notify(notification).await;
				}
				Err(failure.error)
			}
		}
	}

	async fn submit_locked(
		&self,
		sender: Address,
		state: &mut SenderState,
		request: TxRequest,
		signer: Arc<dyn TransactionSigner>,
		cancel: &CancellationToken,
	) -> Result<PendingTxHandle, SubmitFailure> {
		let mut nonce = match state.next_nonce {
			Some(nonce) => nonce,
			None => state.next_free(self.client.get_nonce(sender).await?),
		};
		if state.unfunded {
			self.check_funded(sender, nonce, state, &request).await?;
		}
		let mut signed = signer.sign_transaction(sender, nonce, &request).await?;

		let mut refreshed = false;
		let mut attempts = 0u32;
		let mut backoff = self.backoff();

		loop {
			if cancel.is_cancelled() {
				return Err(SubmitFailure::silent(TxmError::Cancelled));
			}
			attempts += 1;

			match self.client.send_raw_transaction(&signed).await {
				Ok(_)
				| Err(ClientError::SubmissionRejected {
					cause: RejectionCause::AlreadyKnown,
					..
				}) => break,
				Err(ClientError::SubmissionRejected {
					cause: RejectionCause::NonceTooLow,
					message,
				}) => {
					state.next_nonce = None;
					if refreshed {
						tracing::warn!(nonce, %message, "Nonce still too low after refresh");
						return Err(SubmitFailure::dropped(
							sender,
							nonce,
							Some(signed.hash),
							DropCause::NonceTooLow { message },
						));
					}
					refreshed = true;

					let fresh = state.next_free(self.client.get_nonce(sender).await?);
					tracing::info!(stale = nonce, fresh, "Nonce too low, retrying once");
					nonce = fresh;
					signed = signer.sign_transaction(sender, nonce, &request).await?;
				}
				Err(ClientError::SubmissionRejected { cause, message }) => {
					tracing::warn!(nonce, %cause, %message, "Transaction rejected");
					// Refused outright, so the nonce is still free
					state.next_nonce = Some(nonce);
					if cause == RejectionCause::InsufficientFunds {
						state.unfunded = true;
					}
					return Err(SubmitFailure::reported(
						TxmError::Rejected {
							cause: cause.clone(),
							message: message.clone(),
						},
						TxNotification::Rejected {
							sender,
							nonce,
							cause,
							message,
						},
					));
				}
				Err(e) if e.is_retryable() => {
					// The node may have received it; re-read the nonce later
					state.next_nonce = None;
					if attempts >= self.config.max_attempts {
						tracing::error!(nonce, attempts, error = %e, "Giving up on transaction");
						return Err(SubmitFailure::dropped(
							sender,
							nonce,
							Some(signed.hash),
							DropCause::RetriesExhausted {
								attempts,
								last_error: e.to_string(),
							},
						));
					}

					let delay = backoff
						.next_backoff()
						.unwrap_or_else(|| self.config.backoff_max());
					tracing::warn!(
						nonce,
						attempt = attempts,
						delay_ms = delay.as_millis() as u64,
						error = %e,
						"Send failed, retrying"
					);
					tokio::select! {
						biased;
						_ = cancel.cancelled() => return Err(SubmitFailure::silent(TxmError::Cancelled)),
						_ = tokio::time::sleep(delay) => {}
					}
				}
				Err(e) => {
					state.next_nonce = None;
					tracing::error!(nonce, error = %e, "Unexpected response to transaction send");
					let cause = DropCause::Protocol {
						message: e.to_string(),
					};
					return Err(SubmitFailure::reported(
						TxmError::Client(e),
						TxNotification::Dropped {
							sender,
							nonce,
							hash: Some(signed.hash),
							cause,
						},
					));
				}
			}
		}

		let mut tx = PendingTx::new(request, signed);
		tx.attempts = attempts;
		tx.submitted_at = Some(current_timestamp());
		set_state(&mut tx, PendingTxState::Submitted);

		let handle = PendingTxHandle {
			sender,
			nonce,
			hash: tx.hash(),
		};
		tracing::info!(
			nonce,
			tx_hash = %truncate_id(&handle.hash.to_string()),
			attempts,
			"Transaction submitted"
		);

		state.next_nonce = Some(nonce + 1);
		state.track(TrackedSlot::new(tx, Some(signer)));
		Ok(handle)
	}

	/// Fails fast for a sender the node last refused for lack of funds,
	/// unless its balance now covers `request`.
	async fn check_funded(
		&self,
		sender: Address,
		nonce: u64,
		state: &mut SenderState,
		request: &TxRequest,
	) -> Result<(), SubmitFailure> {
		let balance = self.client.get_wei_balance(sender).await?;
		match request.max_cost() {
			Some(cost) if balance >= cost => {
				tracing::info!(%balance, %cost, "Sender funded again");
				state.unfunded = false;
				Ok(())
			}
			cost => {
				let message = match cost {
					Some(cost) => format!("balance {} below required {}", balance, cost),
					None => format!("balance {} below an unbounded cost", balance),
				};
				tracing::warn!(nonce, %message, "Sender still unfunded, not broadcasting");
				state.next_nonce = Some(nonce);
				let cause = RejectionCause::InsufficientFunds;
				Err(SubmitFailure::reported(
					TxmError::Rejected {
						cause: cause.clone(),
						message: message.clone(),
					},
					TxNotification::Rejected {
						sender,
						nonce,
						cause,
						message,
					},
				))
			}
		}
	}

	/// Restores stored `Submitted` records of `sender` after a restart.
	///
	/// The nonce cursor is re-read from the chain on the next submission and
	/// never falls below a restored nonce. Returns the number of records
	/// restored.
	#[instrument(skip_all, fields(sender = %sender))]
	pub async fn resume(
		&self,
		sender: Address,
		signer: Option<Arc<dyn TransactionSigner>>,
	) -> Result<usize, TxmError> {
		let Some(store) = &self.store else {
			return Ok(0);
		};
		let records = store
			.list(sender)
			.await
			.map_err(|e| TxmError::Storage(e.to_string()))?;

		let state = self.sender_state(sender);
		let mut guard = state.lock().await;
		let mut restored = 0;
		for tx in records {
			if tx.state != PendingTxState::Submitted || tx.sender() != sender {
				continue;
			}
			if !guard.slots.contains_key(&tx.nonce) {
				guard.track(TrackedSlot::new(tx, signer.clone()));
				restored += 1;
			}
		}
		guard.next_nonce = None;

		tracing::info!(restored, "Resumed pending transactions");
		Ok(restored)
	}

	/// Snapshot of the transactions in flight for `sender`, in nonce order.
	pub async fn pending(&self, sender: Address) -> Vec<PendingTx> {
		let Some(state) = self.senders.get(&sender).map(|entry| entry.value().clone()) else {
			return Vec::new();
		};
		let guard = state.lock().await;
		guard.slots.values().map(|slot| slot.tx.clone()).collect()
	}

	async fn persist(&self, sender: Address, state: &SenderState) {
		if let Some(store) = &self.store {
			if let Err(e) = store.upsert(sender, &state.live_records()).await {
				tracing::warn!(sender = %sender, error = %e, "Failed to persist pending transactions");
			}
		}
	}

	async fn notify(&self, notification: TxNotification) {
		let consumers = self.consumers.read().await.clone();
		for consumer in consumers {
			consumer.on_notification(&notification).await;
		}
	}
}

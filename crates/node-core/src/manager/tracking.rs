//! Head-driven confirmation tracking.

use super::{
	set_state, PendingTxHandle, SenderState, TrackedSlot, TransactionManager, TxmError,
	WaitOutcome, Waiter, WaiterReply,
};
use node_account::TransactionSigner;
use node_config::StuckPolicy;
use node_rpc::ClientError;
use node_types::{
	current_timestamp, Address, BlockHeader, DropCause, PendingTx, PendingTxState,
	RejectionCause, TxNotification, TxReceipt, WeiAmount,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

enum StuckOutcome {
	/// Still in flight, possibly under a new hash.
	Waiting,
	Dropped(DropCause),
}

/// What one head changed for one sender.
#[derive(Default)]
struct HeadProgress {
	notifications: Vec<TxNotification>,
	replies: Vec<WaiterReply>,
	changed: bool,
}

enum Registration {
	/// Deep enough already; carries the notification owed if this call
	/// confirmed the transaction.
	Reached(TxReceipt, Option<TxNotification>),
	Waiting(oneshot::Receiver<WaitOutcome>),
}

/// Moves a submitted slot to `Confirmed` and builds the notification owed.
fn mark_confirmed(
	sender: Address,
	nonce: u64,
	slot: &mut TrackedSlot,
	receipt: &TxReceipt,
) -> TxNotification {
	set_state(&mut slot.tx, PendingTxState::Confirmed);
	if receipt.success() {
		tracing::info!(nonce, block = receipt.block_number, "Transaction confirmed");
	} else {
		tracing::warn!(nonce, block = receipt.block_number, "Transaction confirmed but reverted");
	}
	TxNotification::Confirmed {
		sender,
		nonce,
		hash: receipt.transaction_hash,
		receipt: receipt.clone(),
	}
}

impl TransactionManager {
	/// Waits until the transaction of `handle` is `min_depth` blocks deep.
	///
	/// Progress is made by [`TransactionManager::on_new_head`]. The
	/// transaction is confirmed, and consumers notified, no later than the
	/// head at which this call returns, even when `min_depth` is below the
	/// configured confirmation depth. Cancelling only stops waiting: the
	/// transaction stays in flight on chain, which is reported as
	/// [`TxmError::TrackingCancelled`].
	pub async fn confirm(
		&self,
		handle: &PendingTxHandle,
		min_depth: u64,
		cancel: &CancellationToken,
	) -> Result<TxReceipt, TxmError> {
		let unknown = || TxmError::UnknownTransaction {
			sender: handle.sender,
			nonce: handle.nonce,
		};
		let state = self
			.senders
			.get(&handle.sender)
			.map(|entry| entry.value().clone())
			.ok_or_else(unknown)?;

		let registration = {
			let mut guard = state.lock().await;
			if !guard.slots.contains_key(&handle.nonce) {
				return match guard.settled.get(&handle.nonce) {
					Some(outcome) => outcome.clone().into_result(handle),
					None => Err(unknown()),
				};
			}

			let head = self.last_head();
			let registration = match guard.slots.get_mut(&handle.nonce) {
				None => return Err(unknown()),
				Some(slot) => match (slot.receipt.clone(), head) {
					(Some(receipt), Some(head)) if receipt.depth_at(head) >= min_depth => {
						let notification = (slot.tx.state == PendingTxState::Submitted)
							.then(|| mark_confirmed(handle.sender, handle.nonce, slot, &receipt));
						Registration::Reached(receipt, notification)
					}
					_ => {
						let (respond, response) = oneshot::channel();
						slot.waiters.push(Waiter {
							depth: min_depth,
							respond,
						});
						Registration::Waiting(response)
					}
				},
			};
			if let Registration::Reached(_, Some(_)) = &registration {
				self.persist(handle.sender, &guard).await;
			}
			registration
		};

		let response = match registration {
			Registration::Reached(receipt, notification) => {
				if let Some(notification) = notification {
					self.notify(notification).await;
				}
				return Ok(receipt);
			}
			Registration::Waiting(response) => response,
		};

		tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(TxmError::TrackingCancelled { hash: handle.hash }),
			outcome = response => match outcome {
				Ok(outcome) => outcome.into_result(handle),
				// Manager went away with the transaction still in flight
				Err(_) => Err(TxmError::TrackingCancelled { hash: handle.hash }),
			},
		}
	}

	/// Advances confirmation tracking to `head`.
	///
	/// Heads at or below the last processed number are ignored, so a head
	/// delivered twice never confirms or notifies twice.
	#[instrument(skip_all, fields(head = head.number))]
	pub async fn on_new_head(&self, head: &BlockHeader) {
		let _gate = self.head_gate.lock().await;
		{
			let mut last = self.last_head_guard();
			if let Some(previous) = *last {
				if head.number <= previous {
					tracing::debug!(previous, "Ignoring stale or duplicate head");
					return;
				}
			}
			*last = Some(head.number);
		}

		let senders: Vec<_> = self
			.senders
			.iter()
			.map(|entry| (*entry.key(), entry.value().clone()))
			.collect();

		for (sender, state) in senders {
			let progress = {
				let mut guard = state.lock().await;
				if guard.slots.is_empty() {
					continue;
				}
				let progress = self.track_sender(sender, &mut guard, head).await;
				if progress.changed {
					self.persist(sender, &guard).await;
				}
				progress
			};

			// Outside the sender lock so consumers may submit again. Waiters
			// hear only after consumers have.
			for notification in progress.notifications {
				self.notify(notification).await;
			}
			for reply in progress.replies {
				reply.deliver();
			}
		}
	}

	async fn track_sender(
		&self,
		sender: Address,
		state: &mut SenderState,
		head: &BlockHeader,
	) -> HeadProgress {
		let mut progress = HeadProgress::default();
		let mut settled = Vec::new();

		for (&nonce, slot) in state.slots.iter_mut() {
			slot.waiters.retain(|waiter| !waiter.respond.is_closed());

			match self.poll_receipt(slot).await {
				Ok(Some(receipt)) => {
					if slot.receipt.as_ref() != Some(&receipt) {
						tracing::debug!(nonce, block = receipt.block_number, "Receipt observed");
					}
					slot.receipt = Some(receipt);
					slot.heads_without_receipt = 0;
				}
				Ok(None) => {
					if let Some(lost) = slot.receipt.take() {
						tracing::warn!(
							nonce,
							block = lost.block_number,
							"Receipt disappeared, chain reorganised"
						);
					}
					if slot.tx.state == PendingTxState::Submitted {
						slot.heads_without_receipt += 1;
					}
				}
				Err(e) => {
					tracing::warn!(nonce, error = %e, "Receipt poll failed");
					continue;
				}
			}

			if let Some(receipt) = slot.receipt.clone() {
				let depth = receipt.depth_at(head.number);
				let threshold = slot.confirm_threshold(self.config.min_confirmations);

				if slot.tx.state == PendingTxState::Submitted && depth >= threshold {
					progress.changed = true;
					progress
						.notifications
						.push(mark_confirmed(sender, nonce, slot, &receipt));
				}
				progress.replies.extend(slot.take_ready(depth, &receipt));

				if slot.tx.state == PendingTxState::Confirmed && slot.waiters.is_empty() {
					settled.push((nonce, WaitOutcome::Confirmed(receipt)));
				}
				continue;
			}

			if slot.tx.state == PendingTxState::Submitted
				&& slot.heads_without_receipt >= self.config.stuck_after_heads
			{
				progress.changed = true;
				if let StuckOutcome::Dropped(cause) = self.handle_stuck(sender, nonce, slot).await {
					set_state(&mut slot.tx, PendingTxState::Dropped);
					progress.notifications.push(TxNotification::Dropped {
						sender,
						nonce,
						hash: Some(slot.tx.hash()),
						cause: cause.clone(),
					});
					settled.push((nonce, WaitOutcome::Dropped(cause)));
				}
			}
		}

		for (nonce, outcome) in settled {
			if matches!(outcome, WaitOutcome::Dropped(_)) {
				// The abandoned nonce may never be used on chain
				state.next_nonce = None;
			}
			progress.replies.extend(state.settle(nonce, outcome));
		}
		progress
	}

	/// Looks up a receipt for the current attempt, then for replaced ones.
	async fn poll_receipt(&self, slot: &TrackedSlot) -> Result<Option<TxReceipt>, ClientError> {
		if let Some(receipt) = self.client.get_transaction_receipt(slot.tx.hash()).await? {
			return Ok(Some(receipt));
		}
		for previous in slot.replaced.iter().rev() {
			if let Some(receipt) = self.client.get_transaction_receipt(previous.hash()).await? {
				return Ok(Some(receipt));
			}
		}
		Ok(None)
	}

	async fn handle_stuck(
		&self,
		sender: Address,
		nonce: u64,
		slot: &mut TrackedSlot,
	) -> StuckOutcome {
		let heads = slot.heads_without_receipt;
		match self.config.stuck_policy {
			StuckPolicy::Abandon => {
				tracing::warn!(nonce, heads, "Transaction stuck, abandoning");
				StuckOutcome::Dropped(DropCause::Stuck { heads })
			}
			StuckPolicy::BumpFee { percent } => {
				if slot.tx.attempts >= self.config.max_attempts {
					tracing::warn!(nonce, attempts = slot.tx.attempts, "Fee bumps exhausted");
					return StuckOutcome::Dropped(DropCause::RetriesExhausted {
						attempts: slot.tx.attempts,
						last_error: format!("no receipt after {} heads", heads),
					});
				}
				let Some(signer) = slot.signer.clone() else {
					tracing::warn!(nonce, "No signer to replace stuck transaction, abandoning");
					return StuckOutcome::Dropped(DropCause::Stuck { heads });
				};
				self.bump_fee(sender, nonce, slot, signer, percent).await
			}
		}
	}

	async fn bump_fee(
		&self,
		sender: Address,
		nonce: u64,
		slot: &mut TrackedSlot,
		signer: Arc<dyn TransactionSigner>,
		percent: u64,
	) -> StuckOutcome {
		slot.heads_without_receipt = 0;
		slot.tx.attempts += 1;

		let current = slot.tx.request.gas_price.unwrap_or(WeiAmount::ZERO);
		let Some(mut gas_price) = current.bumped_by_percent(percent) else {
			return StuckOutcome::Dropped(DropCause::Protocol {
				message: format!("gas price {} cannot be bumped", current),
			});
		};
		// Never replace below what the network currently asks
		if let Ok(network) = self.client.get_gas_price().await {
			gas_price = gas_price.max(network);
		}

		let request = slot.tx.request.clone().with_gas_price(gas_price);
		let signed = match signer.sign_transaction(sender, nonce, &request).await {
			Ok(signed) => signed,
			Err(e) => {
				tracing::warn!(nonce, error = %e, "Could not sign replacement");
				return StuckOutcome::Waiting;
			}
		};

		match self.client.send_raw_transaction(&signed).await {
			Ok(_)
			| Err(ClientError::SubmissionRejected {
				cause: RejectionCause::AlreadyKnown,
				..
			}) => {
				let mut replacement = PendingTx::new(request, signed);
				replacement.attempts = slot.tx.attempts;
				replacement.submitted_at = Some(current_timestamp());
				set_state(&mut replacement, PendingTxState::Submitted);

				let mut previous = std::mem::replace(&mut slot.tx, replacement);
				set_state(&mut previous, PendingTxState::Replaced);
				tracing::info!(
					nonce,
					previous = %previous.hash(),
					replacement = %slot.tx.hash(),
					%gas_price,
					"Replaced stuck transaction with a higher fee"
				);
				slot.replaced.push(previous);
			}
			Err(e) => {
				// NonceTooLow here means an earlier attempt was mined
				tracing::warn!(nonce, error = %e, "Replacement not accepted, keeping current attempt");
			}
		}
		StuckOutcome::Waiting
	}
}

//! Subscription handles and typed notification streams.

use crate::{ClientError, RawSubscription, Transport};
use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Live subscriptions of one client, keyed by subscription id.
pub(crate) type Registry = Arc<Mutex<HashMap<String, Arc<SubscriptionState>>>>;

pub(crate) fn lock_registry(
	registry: &Registry,
) -> MutexGuard<'_, HashMap<String, Arc<SubscriptionState>>> {
	registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by a handle, its stream and the owning client.
pub(crate) struct SubscriptionState {
	id: String,
	closed: AtomicBool,
	cancel: CancellationToken,
	decode_failure: Mutex<Option<ClientError>>,
	transport_failure: watch::Receiver<Option<String>>,
}

impl SubscriptionState {
	/// Marks the subscription closed. Returns `true` only for the first call,
	/// which is the one that must release the transport registration.
	pub(crate) fn mark_closed(&self) -> bool {
		let first = !self.closed.swap(true, Ordering::AcqRel);
		if first {
			self.cancel.cancel();
		}
		first
	}

	pub(crate) fn id(&self) -> &str {
		&self.id
	}

	fn record_decode_failure(&self, error: ClientError) {
		let mut slot = self
			.decode_failure
			.lock()
			.unwrap_or_else(PoisonError::into_inner);
		slot.get_or_insert(error);
	}
}

/// Handle owning one push registration on the transport.
///
/// The registration is released exactly once: by [`Subscription::close`], by
/// the client's shutdown, or on drop.
pub struct Subscription {
	state: Arc<SubscriptionState>,
	transport: Arc<dyn Transport>,
	registry: Registry,
}

impl Subscription {
	/// Wraps a transport registration, returning the handle and a stream
	/// that turns each notification into a `T` with `decode`.
	pub(crate) fn register<T>(
		raw: RawSubscription,
		decode: Decoder<T>,
		transport: Arc<dyn Transport>,
		registry: Registry,
	) -> (Self, SubscriptionStream<T>) {
		let cancel = CancellationToken::new();
		let state = Arc::new(SubscriptionState {
			id: raw.id,
			closed: AtomicBool::new(false),
			cancel: cancel.clone(),
			decode_failure: Mutex::new(None),
			transport_failure: raw.failure,
		});
		lock_registry(&registry).insert(state.id.clone(), state.clone());

		let stream = SubscriptionStream {
			notifications: raw.notifications,
			cancelled: Box::pin(cancel.cancelled_owned()),
			state: state.clone(),
			done: false,
			decode,
		};

		(
			Self {
				state,
				transport,
				registry,
			},
			stream,
		)
	}

	/// Subscription id assigned by the node.
	pub fn id(&self) -> &str {
		&self.state.id
	}

	pub fn is_closed(&self) -> bool {
		self.state.closed.load(Ordering::Acquire)
	}

	/// Why the stream ended, if it ended abnormally.
	///
	/// A payload that failed to decode takes precedence over a transport
	/// failure, since it ends the stream first.
	pub fn failure(&self) -> Option<ClientError> {
		let decode = self
			.state
			.decode_failure
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone();
		decode.or_else(|| {
			self.state
				.transport_failure
				.borrow()
				.clone()
				.map(ClientError::Transport)
		})
	}

	/// Ends the stream and releases the transport registration.
	///
	/// Closing twice is a no-op.
	pub async fn close(&self) -> Result<(), ClientError> {
		if !self.state.mark_closed() {
			return Ok(());
		}
		lock_registry(&self.registry).remove(&self.state.id);
		tracing::debug!(subscription = %self.state.id, "Closing subscription");

		// Nothing left to release once the connection itself has failed
		if self.state.transport_failure.borrow().is_some() {
			return Ok(());
		}
		self.transport.unsubscribe(&self.state.id).await
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if !self.state.mark_closed() {
			return;
		}
		lock_registry(&self.registry).remove(&self.state.id);

		// Best effort: only possible from within a runtime
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			let transport = self.transport.clone();
			let id = self.state.id.clone();
			handle.spawn(async move {
				if let Err(e) = transport.unsubscribe(&id).await {
					tracing::debug!(subscription = %id, error = %e, "Unsubscribe on drop failed");
				}
			});
		}
	}
}

/// Turns one raw notification into a typed item.
pub(crate) type Decoder<T> = fn(Value) -> Result<T, ClientError>;

/// Stream of decoded notifications for one subscription.
///
/// Ends when the subscription is closed, when the transport fails, or at the
/// first payload that does not decode as `T`. The handle's
/// [`Subscription::failure`] tells these apart.
pub struct SubscriptionStream<T> {
	notifications: mpsc::UnboundedReceiver<Value>,
	cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
	state: Arc<SubscriptionState>,
	done: bool,
	decode: Decoder<T>,
}

impl<T> Stream for SubscriptionStream<T> {
	type Item = T;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
		let this = self.get_mut();
		if this.done {
			return Poll::Ready(None);
		}
		if this.cancelled.as_mut().poll(cx).is_ready() {
			this.done = true;
			return Poll::Ready(None);
		}

		match ready!(this.notifications.poll_recv(cx)) {
			Some(value) => match (this.decode)(value) {
				Ok(item) => Poll::Ready(Some(item)),
				Err(e) => {
					tracing::error!(
						subscription = %this.state.id,
						error = %e,
						"Undecodable notification, ending stream"
					);
					this.state.record_decode_failure(e);
					this.done = true;
					Poll::Ready(None)
				}
			},
			None => {
				this.done = true;
				Poll::Ready(None)
			}
		}
	}
}

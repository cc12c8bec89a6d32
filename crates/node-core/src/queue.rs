//! Bounded, closeable event queue.
//!
//! Many producers feed one consumer. Closing the queue stops new sends but
//! keeps buffered events deliverable; the consumer then observes an explicit
//! [`Delivery::Closed`] marker instead of a default value.

use futures::Stream;
use node_config::{OverflowPolicy, QueueConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// Errors returned to producers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
	#[error("Queue is closed")]
	Closed,
	#[error("Queue stayed full for {0:?}")]
	Full(Duration),
}

/// What a consumer receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<E> {
	Event(E),
	/// The queue was closed and every buffered event has been delivered.
	Closed,
}

struct Buffer<E> {
	events: VecDeque<E>,
	closed: bool,
}

pub struct EventQueue<E> {
	buffer: Mutex<Buffer<E>>,
	capacity: usize,
	overflow: OverflowPolicy,
	send_timeout: Duration,
	item_ready: Notify,
	space_ready: Notify,
	dropped: AtomicU64,
}

impl<E: Send> EventQueue<E> {
	pub fn new(capacity: usize, overflow: OverflowPolicy, send_timeout: Duration) -> Self {
		Self {
			buffer: Mutex::new(Buffer {
				events: VecDeque::with_capacity(capacity.min(1024)),
				closed: false,
			}),
			capacity: capacity.max(1),
			overflow,
			send_timeout,
			item_ready: Notify::new(),
			space_ready: Notify::new(),
			dropped: AtomicU64::new(0),
		}
	}

	pub fn from_config(config: &QueueConfig) -> Self {
		Self::new(config.capacity, config.overflow, config.send_timeout())
	}

	fn lock(&self) -> MutexGuard<'_, Buffer<E>> {
		self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Enqueues `event`.
	///
	/// With the `block` policy a full queue makes the caller wait for space,
	/// at most the configured send timeout. With `drop_oldest` the oldest
	/// buffered event is evicted instead.
	pub async fn send(&self, event: E) -> Result<(), QueueError> {
		match self.overflow {
			OverflowPolicy::DropOldest => {
				let mut buffer = self.lock();
				if buffer.closed {
					return Err(QueueError::Closed);
				}
				if buffer.events.len() >= self.capacity {
					buffer.events.pop_front();
					let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
					tracing::warn!(dropped, "Event queue full, evicted oldest event");
				}
				buffer.events.push_back(event);
				drop(buffer);
				self.item_ready.notify_one();
				Ok(())
			}
			OverflowPolicy::Block => {
				let deadline = tokio::time::Instant::now() + self.send_timeout;
				loop {
					// Registered before checking so a wakeup in between is kept
					let space = self.space_ready.notified();
					tokio::pin!(space);
					space.as_mut().enable();

					{
						let mut buffer = self.lock();
						if buffer.closed {
							return Err(QueueError::Closed);
						}
						if buffer.events.len() < self.capacity {
							buffer.events.push_back(event);
							drop(buffer);
							self.item_ready.notify_one();
							return Ok(());
						}
					}

					if tokio::time::timeout_at(deadline, space).await.is_err() {
						return Err(QueueError::Full(self.send_timeout));
					}
				}
			}
		}
	}

	/// Returns the consumer side of the queue.
	pub fn receive(self: &Arc<Self>) -> QueueReceiver<E> {
		QueueReceiver {
			queue: self.clone(),
		}
	}

	/// Stops accepting events. Closing twice is a no-op.
	pub fn close(&self) {
		let mut buffer = self.lock();
		if buffer.closed {
			return;
		}
		buffer.closed = true;
		let remaining = buffer.events.len();
		drop(buffer);

		tracing::debug!(remaining, "Event queue closed");
		self.item_ready.notify_waiters();
		self.space_ready.notify_waiters();
	}

	pub fn len(&self) -> usize {
		self.lock().events.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn is_closed(&self) -> bool {
		self.lock().closed
	}

	/// Events evicted under the `drop_oldest` policy.
	pub fn dropped_count(&self) -> u64 {
		self.dropped.load(Ordering::Relaxed)
	}
}

/// Consumer handle. Meant for a single consuming task; ordering across
/// several receivers of the same queue is unspecified.
pub struct QueueReceiver<E> {
	queue: Arc<EventQueue<E>>,
}

impl<E: Send> QueueReceiver<E> {
	/// Waits for the next event, or [`Delivery::Closed`] once the queue is
	/// closed and drained.
	pub async fn recv(&mut self) -> Delivery<E> {
		loop {
			let ready = self.queue.item_ready.notified();
			tokio::pin!(ready);
			ready.as_mut().enable();

			{
				let mut buffer = self.queue.lock();
				if let Some(event) = buffer.events.pop_front() {
					drop(buffer);
					self.queue.space_ready.notify_one();
					return Delivery::Event(event);
				}
				if buffer.closed {
					return Delivery::Closed;
				}
			}

			ready.await;
		}
	}

	/// Adapts the receiver into a stream that ends on close.
	pub fn into_stream(self) -> impl Stream<Item = E> {
		futures::stream::unfold(self, |mut receiver| async move {
			match receiver.recv().await {
				Delivery::Event(event) => Some((event, receiver)),
				Delivery::Closed => None,
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures::StreamExt;

	fn queue(capacity: usize, overflow: OverflowPolicy) -> Arc<EventQueue<u32>> {
		Arc::new(EventQueue::new(capacity, overflow, Duration::from_millis(100)))
	}

	#[tokio::test]
	async fn test_delivers_in_send_order() {
		let queue = queue(16, OverflowPolicy::Block);
		for i in 0..10 {
			queue.send(i).await.unwrap();
		}
		let mut receiver = queue.receive();
		for i in 0..10 {
			assert_eq!(receiver.recv().await, Delivery::Event(i));
		}
		assert!(queue.is_empty());
	}

	#[tokio::test]
	async fn test_close_drains_buffer_then_reports_closed() {
		let queue = queue(16, OverflowPolicy::Block);
		for i in 0..3 {
			queue.send(i).await.unwrap();
		}
		queue.close();
		queue.close();

		assert_eq!(queue.send(99).await, Err(QueueError::Closed));
		let events: Vec<_> = queue.receive().into_stream().collect().await;
		assert_eq!(events, vec![0, 1, 2]);
	}

	#[tokio::test]
	async fn test_close_while_consumer_waits() {
		let queue = queue(16, OverflowPolicy::Block);
		let mut receiver = queue.receive();

		let consumer = tokio::spawn(async move {
			let mut seen = Vec::new();
			loop {
				match receiver.recv().await {
					Delivery::Event(event) => seen.push(event),
					Delivery::Closed => return seen,
				}
			}
		});

		// Give the consumer time to park inside recv
		tokio::task::yield_now().await;
		queue.send(1).await.unwrap();
		queue.send(2).await.unwrap();
		queue.close();

		assert_eq!(consumer.await.unwrap(), vec![1, 2]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_block_policy_times_out_when_full() {
		let queue = queue(2, OverflowPolicy::Block);
		queue.send(1).await.unwrap();
		queue.send(2).await.unwrap();

		assert_eq!(
			queue.send(3).await,
			Err(QueueError::Full(Duration::from_millis(100)))
		);
		assert_eq!(queue.len(), 2);
	}

	#[tokio::test]
	async fn test_block_policy_resumes_when_drained() {
		let queue = queue(1, OverflowPolicy::Block);
		queue.send(1).await.unwrap();

		let producer = {
			let queue = queue.clone();
			tokio::spawn(async move { queue.send(2).await })
		};
		tokio::task::yield_now().await;

		let mut receiver = queue.receive();
		assert_eq!(receiver.recv().await, Delivery::Event(1));
		assert_eq!(producer.await.unwrap(), Ok(()));
		assert_eq!(receiver.recv().await, Delivery::Event(2));
	}

	#[tokio::test]
	async fn test_close_releases_blocked_producer() {
		let queue = Arc::new(EventQueue::new(1, OverflowPolicy::Block, Duration::from_secs(60)));
		queue.send(1u32).await.unwrap();

		let producer = {
			let queue = queue.clone();
			tokio::spawn(async move { queue.send(2).await })
		};
		tokio::task::yield_now().await;
		queue.close();

		assert_eq!(producer.await.unwrap(), Err(QueueError::Closed));
	}

	#[tokio::test]
	async fn test_drop_oldest_evicts() {
		let queue = queue(2, OverflowPolicy::DropOldest);
		for i in 0..5 {
			queue.send(i).await.unwrap();
		}
		assert_eq!(queue.dropped_count(), 3);

		queue.close();
		let events: Vec<_> = queue.receive().into_stream().collect().await;
		assert_eq!(events, vec![3, 4]);
	}

	#[tokio::test]
	async fn test_per_producer_order_with_concurrent_senders() {
		let queue: Arc<EventQueue<(u32, u32)>> =
			Arc::new(EventQueue::new(8, OverflowPolicy::Block, Duration::from_secs(5)));

		let producers: Vec<_> = (0..4)
			.map(|producer| {
				let queue = queue.clone();
				tokio::spawn(async move {
					for seq in 0..50 {
						queue.send((producer, seq)).await.unwrap();
					}
				})
			})
			.collect();

		let consumer = {
			let mut receiver = queue.receive();
			tokio::spawn(async move {
				let mut seen = Vec::new();
				while let Delivery::Event(event) = receiver.recv().await {
					seen.push(event);
				}
				seen
			})
		};

		for producer in producers {
			producer.await.unwrap();
		}
		queue.close();

		let seen = consumer.await.unwrap();
		assert_eq!(seen.len(), 200);
		for producer in 0..4 {
			let sequence: Vec<_> = seen
				.iter()
				.filter(|(p, _)| *p == producer)
				.map(|(_, seq)| *seq)
				.collect();
			assert_eq!(sequence, (0..50).collect::<Vec<_>>());
		}
	}
}

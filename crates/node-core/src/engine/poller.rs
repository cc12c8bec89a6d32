//! Polling fallback for transports without push subscriptions.
//!
//! Polls the latest block on a fixed interval. Each advance produces one
//! `NewHead` event for the latest header, followed by the logs of every
//! configured filter over the blocks since the previous advance.

use crate::queue::{EventQueue, QueueError};
use node_rpc::{ClientError, ProtocolClient};
use node_types::{BlockTag, LogFilter, RunEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub struct ChainPoller {
	client: Arc<ProtocolClient>,
	interval: Duration,
	heads: bool,
	filters: Vec<LogFilter>,
}

impl ChainPoller {
	pub fn new(
		client: Arc<ProtocolClient>,
		interval: Duration,
		heads: bool,
		filters: Vec<LogFilter>,
	) -> Self {
		Self {
			client,
			interval,
			heads,
			filters,
		}
	}

	/// Polls until `stop` fires or the queue closes.
	#[instrument(skip_all, fields(interval_ms = self.interval.as_millis() as u64))]
	pub async fn run(&self, queue: Arc<EventQueue<RunEvent>>, stop: CancellationToken) {
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut last: Option<u64> = None;

		loop {
			tokio::select! {
				biased;
				_ = stop.cancelled() => break,
				_ = ticker.tick() => {}
			}

			match self.poll(last, &queue).await {
				Ok(Some(number)) => last = Some(number),
				Ok(None) => {}
				Err(PollError::Closed) => break,
				Err(PollError::Client(e)) => {
					tracing::warn!(error = %e, "Chain poll failed, retrying next tick");
				}
			}
		}
		tracing::debug!("Poller stopped");
	}

	/// One poll round. Returns the new head number when the chain advanced.
	async fn poll(
		&self,
		last: Option<u64>,
		queue: &EventQueue<RunEvent>,
	) -> Result<Option<u64>, PollError> {
		let head = self.client.get_block_by_number(BlockTag::Latest).await?;
		if last.is_some_and(|previous| head.number <= previous) {
			return Ok(None);
		}
		let number = head.number;
		// Logs are only followed from the first observed head onwards
		let from = last.map_or(number, |previous| previous + 1);

		let mut events = Vec::new();
		if self.heads {
			events.push(RunEvent::NewHead(head));
		}
		for filter in &self.filters {
			let range = filter.clone().from_block(from).to_block(number);
			let logs = self.client.get_logs(&range).await?;
			events.extend(logs.into_iter().map(RunEvent::Log));
		}

		for event in events {
			match queue.send(event).await {
				Ok(()) => {}
				Err(QueueError::Closed) => return Err(PollError::Closed),
				Err(e) => tracing::warn!(error = %e, "Dropping polled event"),
			}
		}
		Ok(Some(number))
	}
}

enum PollError {
	Client(ClientError),
	Closed,
}

impl From<ClientError> for PollError {
	fn from(err: ClientError) -> Self {
		PollError::Client(err)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::queue::Delivery;
	use node_config::OverflowPolicy;
	use node_rpc::testing::{header_json, log_json, MockTransport};
	use node_types::Address;
	use serde_json::json;
	use std::sync::Mutex;

	#[tokio::test]
	async fn test_poll_rounds_emit_heads_and_log_ranges() {
		let transport = Arc::new(MockTransport::without_subscriptions());
		let heads = Arc::new(Mutex::new(vec![12u64, 12, 10]));
		{
			let heads = heads.clone();
			transport.on("eth_getBlockByNumber", move |_| {
				Ok(header_json(heads.lock().unwrap().pop().unwrap_or(12)))
			});
		}
		transport.on("eth_getLogs", |params| {
			let to = params[0]["toBlock"].as_str().unwrap_or("0x0").to_string();
			let block = u64::from_str_radix(to.trim_start_matches("0x"), 16).unwrap();
			Ok(json!([log_json(Address::repeat_byte(0x11), block)]))
		});

		let client = Arc::new(ProtocolClient::new(transport.clone()));
		let filter = LogFilter::new().address(Address::repeat_byte(0x11));
		let poller = ChainPoller::new(client, Duration::from_secs(1), true, vec![filter]);
		let queue = Arc::new(EventQueue::new(16, OverflowPolicy::Block, Duration::from_secs(1)));

		// First round anchors at block 10, the second covers 11..=12, the
		// third sees no advance.
		assert_eq!(poller.poll(None, &queue).await.ok().flatten(), Some(10));
		assert_eq!(poller.poll(Some(10), &queue).await.ok().flatten(), Some(12));
		assert_eq!(poller.poll(Some(12), &queue).await.ok().flatten(), None);

		let ranges: Vec<_> = transport
			.calls("eth_getLogs")
			.iter()
			.map(|params| {
				(
					params[0]["fromBlock"].as_str().unwrap_or_default().to_string(),
					params[0]["toBlock"].as_str().unwrap_or_default().to_string(),
				)
			})
			.collect();
		assert_eq!(
			ranges,
			vec![
				("0xa".to_string(), "0xa".to_string()),
				("0xb".to_string(), "0xc".to_string()),
			]
		);

		queue.close();
		let mut receiver = queue.receive();
		let mut kinds = Vec::new();
		while let Delivery::Event(event) = receiver.recv().await {
			kinds.push(event.kind());
		}
		assert_eq!(kinds, vec!["new_head", "log", "new_head", "log"]);
	}

	#[tokio::test]
	async fn test_poll_stops_when_queue_closed() {
		let transport = Arc::new(MockTransport::without_subscriptions());
		transport.respond("eth_getBlockByNumber", header_json(5));
		let client = Arc::new(ProtocolClient::new(transport));
		let poller = ChainPoller::new(client, Duration::from_millis(10), true, Vec::new());

		let queue = Arc::new(EventQueue::new(4, OverflowPolicy::Block, Duration::from_secs(1)));
		queue.close();
		// Returns on its own without the stop token firing
		tokio::time::timeout(Duration::from_secs(5), poller.run(queue, CancellationToken::new()))
			.await
			.unwrap();
	}
}

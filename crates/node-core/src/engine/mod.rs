//! Node engine that feeds chain events to the job pipeline.
//!
//! The engine owns the event queue. Subscription forwarders (or the head
//! poller when the transport has no push support) are the producers; the
//! engine's run loop is the single consumer. Every new head is handed to the
//! transaction manager before the pipeline sees it, so confirmations progress
//! even when the pipeline ignores heads.

pub mod poller;

use crate::queue::{Delivery, EventQueue, QueueError};
use crate::TransactionManager;
use async_trait::async_trait;
use futures::StreamExt;
use node_config::Config;
use node_rpc::{ClientError, ProtocolClient, Subscription, SubscriptionStream};
use node_types::{RunEvent, RunRequest};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use self::poller::ChainPoller;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Service error: {0}")]
	Service(String),
	#[error("Handler error: {0}")]
	Handler(String),
	/// An event source stopped while the engine was running.
	#[error("Subscription '{source_name}' ended: {reason}")]
	Subscription { source_name: String, reason: String },
}

impl From<ClientError> for EngineError {
	fn from(err: ClientError) -> Self {
		EngineError::Service(err.to_string())
	}
}

/// Consumer of every event leaving the queue.
#[async_trait]
pub trait JobPipeline: Send + Sync {
	async fn handle_event(&self, event: &RunEvent) -> Result<(), EngineError>;
}

/// Wires the protocol client, the event queue and the transaction manager.
pub struct NodeEngine {
	config: Config,
	client: Arc<ProtocolClient>,
	manager: Arc<TransactionManager>,
	pipeline: Arc<dyn JobPipeline>,
	queue: Arc<EventQueue<RunEvent>>,
	shutdown: CancellationToken,
}

impl NodeEngine {
	pub fn new(
		config: Config,
		client: Arc<ProtocolClient>,
		manager: Arc<TransactionManager>,
		pipeline: Arc<dyn JobPipeline>,
	) -> Self {
		let queue = Arc::new(EventQueue::from_config(&config.queue));
		Self {
			config,
			client,
			manager,
			pipeline,
			queue,
			shutdown: CancellationToken::new(),
		}
	}

	/// Token that stops [`NodeEngine::run`] when cancelled.
	pub fn shutdown_token(&self) -> CancellationToken {
		self.shutdown.clone()
	}

	pub fn queue(&self) -> &Arc<EventQueue<RunEvent>> {
		&self.queue
	}

	pub fn manager(&self) -> &Arc<TransactionManager> {
		&self.manager
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Enqueues a job run on behalf of the pipeline.
	pub async fn trigger_run(&self, request: RunRequest) -> Result<(), QueueError> {
		tracing::debug!(job_id = %request.job_id, "Run requested");
		self.queue.send(RunEvent::RunRequest(request)).await
	}

	/// Checks that the remote node serves the configured chain.
	pub async fn initialize(&self) -> Result<(), EngineError> {
		let chain_id = self.client.get_chain_id().await?;
		if let Some(expected) = self.config.node.chain_id {
			if chain_id != expected {
				return Err(EngineError::Config(format!(
					"Remote node serves chain {} but {} is configured",
					chain_id, expected
				)));
			}
		}
		tracing::info!(chain_id, "Connected to chain");
		Ok(())
	}

	/// Runs until the shutdown token fires, ctrl-c, or an event source fails.
	///
	/// On the way out the producers stop, the queue is closed and drained
	/// into the pipeline, and the client releases its subscriptions.
	pub async fn run(&self) -> Result<(), EngineError> {
		self.run_until(tokio::signal::ctrl_c()).await
	}

	/// Same as [`NodeEngine::run`] with `interrupt` in place of ctrl-c.
	///
	/// The interrupt future is created once and polled across loop
	/// iterations. If it resolves to an error the engine keeps running
	/// without it.
	#[instrument(skip_all, fields(node = %self.config.node.id))]
	async fn run_until<I>(&self, interrupt: I) -> Result<(), EngineError>
	where
		I: Future<Output = std::io::Result<()>>,
	{
		self.initialize().await?;

		let producers = self.shutdown.child_token();
		let (failures_tx, mut failures_rx) = mpsc::unbounded_channel();
		let tasks = match self.start_producers(&producers, &failures_tx).await {
			Ok(tasks) => tasks,
			Err(e) => {
				producers.cancel();
				self.client.shutdown().await;
				return Err(e);
			}
		};
		drop(failures_tx);
		tracing::info!(producers = tasks.len(), "Engine running");

		let mut receiver = self.queue.receive();
		let mut stopping = false;
		let mut failure = None;
		tokio::pin!(interrupt);
		let mut interrupt_armed = true;

		loop {
			tokio::select! {
				delivery = receiver.recv() => match delivery {
					Delivery::Event(event) => self.dispatch(event).await,
					Delivery::Closed => break,
				},

				_ = self.shutdown.cancelled(), if !stopping => {
					tracing::info!("Shutdown requested");
					stopping = true;
					self.stop(&producers);
				}

				signal = &mut interrupt, if interrupt_armed && !stopping => {
					interrupt_armed = false;
					match signal {
						Ok(()) => {
							tracing::info!("Interrupted");
							stopping = true;
							self.stop(&producers);
						}
						Err(e) => tracing::warn!(error = %e, "Cannot listen for interrupts"),
					}
				}

				Some(error) = failures_rx.recv(), if !stopping => {
					tracing::error!(error = %error, "Event source failed, stopping engine");
					failure = Some(error);
					stopping = true;
					self.stop(&producers);
				}
			}
		}

		producers.cancel();
		for task in tasks {
			if let Err(e) = task.await {
				tracing::warn!(error = %e, "Producer task panicked");
			}
		}
		self.client.shutdown().await;
		tracing::info!(dropped = self.queue.dropped_count(), "Engine stopped");

		match failure {
			Some(error) => Err(error),
			None => Ok(()),
		}
	}

	/// Stops the producers and closes the queue; buffered events still
	/// reach the pipeline.
	fn stop(&self, producers: &CancellationToken) {
		producers.cancel();
		self.queue.close();
	}

	async fn dispatch(&self, event: RunEvent) {
		if let RunEvent::NewHead(head) = &event {
			self.manager.on_new_head(head).await;
		}
		if let Err(e) = self.pipeline.handle_event(&event).await {
			tracing::error!(kind = event.kind(), error = %e, "Pipeline failed to handle event");
		}
	}

	async fn start_producers(
		&self,
		stop: &CancellationToken,
		failures: &mpsc::UnboundedSender<EngineError>,
	) -> Result<Vec<JoinHandle<()>>, EngineError> {
		let settings = &self.config.subscriptions;
		let mut tasks = Vec::new();

		if !self.client.supports_subscriptions() {
			if settings.new_heads || !settings.logs.is_empty() {
				tracing::info!(
					interval_secs = settings.poll_interval_seconds,
					"Transport has no push support, polling"
				);
				let poller = ChainPoller::new(
					self.client.clone(),
					settings.poll_interval(),
					settings.new_heads,
					settings.logs.clone(),
				);
				let queue = self.queue.clone();
				let stop = stop.clone();
				tasks.push(tokio::spawn(async move { poller.run(queue, stop).await }));
			}
			return Ok(tasks);
		}

		if settings.new_heads {
			let (subscription, stream) = self.client.subscribe_new_heads().await?;
			tasks.push(self.spawn_forwarder(
				"newHeads".to_string(),
				subscription,
				stream,
				RunEvent::NewHead,
				stop,
				failures,
			));
		}
		for (index, filter) in settings.logs.iter().enumerate() {
			let (subscription, stream) = self.client.subscribe_logs(filter).await?;
			tasks.push(self.spawn_forwarder(
				format!("logs[{}]", index),
				subscription,
				stream,
				RunEvent::Log,
				stop,
				failures,
			));
		}
		Ok(tasks)
	}

	fn spawn_forwarder<T, F>(
		&self,
		name: String,
		subscription: Subscription,
		stream: SubscriptionStream<T>,
		wrap: F,
		stop: &CancellationToken,
		failures: &mpsc::UnboundedSender<EngineError>,
	) -> JoinHandle<()>
	where
		T: Send + 'static,
		F: Fn(T) -> RunEvent + Send + 'static,
	{
		tracing::debug!(source = %name, subscription = %subscription.id(), "Forwarding subscription");
		tokio::spawn(forward(
			name,
			subscription,
			stream,
			wrap,
			self.queue.clone(),
			stop.clone(),
			failures.clone(),
		))
	}
}

/// Moves deliveries of one subscription into the queue until stopped.
async fn forward<T, F>(
	name: String,
	subscription: Subscription,
	mut stream: SubscriptionStream<T>,
	wrap: F,
	queue: Arc<EventQueue<RunEvent>>,
	stop: CancellationToken,
	failures: mpsc::UnboundedSender<EngineError>,
) where
	T: Send + 'static,
	F: Fn(T) -> RunEvent + Send + 'static,
{
	loop {
		tokio::select! {
			biased;
			_ = stop.cancelled() => break,
			item = stream.next() => match item {
				Some(item) => match queue.send(wrap(item)).await {
					Ok(()) => {}
					Err(QueueError::Closed) => break,
					Err(e) => tracing::warn!(source = %name, error = %e, "Dropping event"),
				},
				None => {
					if !stop.is_cancelled() {
						let reason = subscription
							.failure()
							.map(|e| e.to_string())
							.unwrap_or_else(|| "stream closed".to_string());
						let _ = failures.send(EngineError::Subscription {
							source_name: name.clone(),
							reason,
						});
					}
					break;
				}
			},
		}
	}

	if let Err(e) = subscription.close().await {
		tracing::debug!(source = %name, error = %e, "Closing subscription failed");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use node_config::TransactionsConfig;
	use node_rpc::testing::{header_json, MockTransport};
	use serde_json::json;
	use std::sync::Mutex as StdMutex;
	use std::time::Duration;

	#[derive(Default)]
	struct RecordingPipeline {
		events: StdMutex<Vec<RunEvent>>,
	}

	impl RecordingPipeline {
		fn events(&self) -> Vec<RunEvent> {
			self.events.lock().unwrap().clone()
		}
	}

	#[async_trait]
	impl JobPipeline for RecordingPipeline {
		async fn handle_event(&self, event: &RunEvent) -> Result<(), EngineError> {
			self.events.lock().unwrap().push(event.clone());
			Ok(())
		}
	}

	fn config(extra: &str) -> Config {
		format!(
			r#"
[node]
id = "node-test"
chain_id = 1

[transport]
http_url = "http://localhost:8545"

[storage]
primary = "memory"
[storage.implementations.memory]

[subscriptions]
poll_interval_seconds = 1
{}
"#,
			extra
		)
		.parse()
		.unwrap()
	}

	fn engine(
		transport: Arc<MockTransport>,
		config: Config,
	) -> (Arc<NodeEngine>, Arc<RecordingPipeline>) {
		transport.respond("eth_chainId", json!("0x1"));
		let client = Arc::new(ProtocolClient::new(transport));
		let manager = Arc::new(TransactionManager::new(
			client.clone(),
			TransactionsConfig::default(),
		));
		let pipeline = Arc::new(RecordingPipeline::default());
		let engine = Arc::new(NodeEngine::new(config, client, manager, pipeline.clone()));
		(engine, pipeline)
	}

	async fn eventually(mut condition: impl FnMut() -> bool) {
		tokio::time::timeout(Duration::from_secs(5), async {
			while !condition() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.expect("condition not reached in time");
	}

	#[tokio::test]
	async fn test_pushed_heads_reach_manager_and_pipeline() {
		let transport = Arc::new(MockTransport::new());
		let (engine, pipeline) = engine(transport.clone(), config(""));
		let running = tokio::spawn({
			let engine = engine.clone();
			async move { engine.run().await }
		});

		eventually(|| transport.active_subscriptions() == vec!["0x1".to_string()]).await;
		assert!(transport.push("0x1", header_json(7)));
		eventually(|| pipeline.events().len() == 1).await;
		assert_eq!(engine.manager().last_head(), Some(7));

		engine
			.trigger_run(RunRequest {
				job_id: "job-1".to_string(),
				payload: json!({"feed": "eth-usd"}),
			})
			.await
			.unwrap();
		eventually(|| pipeline.events().len() == 2).await;
		assert!(matches!(&pipeline.events()[1], RunEvent::RunRequest(r) if r.job_id == "job-1"));

		engine.shutdown_token().cancel();
		running.await.unwrap().unwrap();
		assert_eq!(transport.unsubscribed(), vec!["0x1".to_string()]);
		assert!(engine.queue().is_closed());
		assert!(engine
			.trigger_run(RunRequest {
				job_id: "late".to_string(),
				payload: json!(null),
			})
			.await
			.is_err());
	}

	#[tokio::test]
	async fn test_buffered_events_drain_on_shutdown() {
		let transport = Arc::new(MockTransport::new());
		let (engine, pipeline) = engine(transport.clone(), config("new_heads = false"));

		for i in 0..3 {
			engine
				.trigger_run(RunRequest {
					job_id: format!("job-{}", i),
					payload: json!(null),
				})
				.await
				.unwrap();
		}
		engine.shutdown_token().cancel();
		engine.run().await.unwrap();

		let jobs: Vec<_> = pipeline
			.events()
			.into_iter()
			.filter_map(|event| match event {
				RunEvent::RunRequest(r) => Some(r.job_id),
				_ => None,
			})
			.collect();
		assert_eq!(jobs, vec!["job-0", "job-1", "job-2"]);
	}

	#[tokio::test]
	async fn test_chain_id_mismatch_fails_startup() {
		let transport = Arc::new(MockTransport::new());
		let (engine, _) = engine(transport.clone(), config(""));
		transport.respond("eth_chainId", json!("0x5"));

		assert!(matches!(engine.run().await, Err(EngineError::Config(_))));
		assert!(transport.calls("eth_subscribe").is_empty());
	}

	#[tokio::test]
	async fn test_subscription_failure_stops_engine() {
		let transport = Arc::new(MockTransport::new());
		let (engine, _) = engine(transport.clone(), config(""));
		let running = tokio::spawn({
			let engine = engine.clone();
			async move { engine.run().await }
		});

		eventually(|| !transport.active_subscriptions().is_empty()).await;
		transport.fail("connection reset by peer");

		match running.await.unwrap() {
			Err(EngineError::Subscription {
				source_name,
				reason,
			}) => {
				assert_eq!(source_name, "newHeads");
				assert!(reason.contains("connection reset by peer"));
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_polls_heads_without_push_support() {
		let transport = Arc::new(MockTransport::without_subscriptions());
		let block = Arc::new(StdMutex::new(10u64));
		{
			let block = block.clone();
			transport.on("eth_getBlockByNumber", move |_| {
				let mut number = block.lock().unwrap();
				*number += 1;
				Ok(header_json(*number))
			});
		}
		let (engine, pipeline) = engine(transport.clone(), config(""));
		let running = tokio::spawn({
			let engine = engine.clone();
			async move { engine.run().await }
		});

		eventually(|| pipeline.events().len() >= 2).await;
		engine.shutdown_token().cancel();
		running.await.unwrap().unwrap();

		let heads: Vec<_> = pipeline
			.events()
			.into_iter()
			.filter_map(|event| match event {
				RunEvent::NewHead(head) => Some(head.number),
				_ => None,
			})
			.collect();
		assert_eq!(&heads[..2], &[11, 12]);
		assert!(transport.calls("eth_subscribe").is_empty());
	}

	#[tokio::test]
	async fn test_interrupt_future_outlives_dispatches() {
		let transport = Arc::new(MockTransport::new());
		let (engine, pipeline) = engine(transport.clone(), config("new_heads = false"));
		let (interrupt_tx, interrupt_rx) = tokio::sync::oneshot::channel::<()>();
		let running = tokio::spawn({
			let engine = engine.clone();
			async move {
				engine
					.run_until(async move {
						let _ = interrupt_rx.await;
						Ok(())
					})
					.await
			}
		});

		for i in 0..20 {
			engine
				.trigger_run(RunRequest {
					job_id: format!("job-{}", i),
					payload: json!(null),
				})
				.await
				.unwrap();
		}
		eventually(|| pipeline.events().len() == 20).await;
		assert!(!running.is_finished());

		// The same receiver armed before the first dispatch still fires
		interrupt_tx.send(()).unwrap();
		running.await.unwrap().unwrap();
		assert!(engine.queue().is_closed());
	}

	#[tokio::test]
	async fn test_failed_interrupt_listener_keeps_engine_running() {
		let transport = Arc::new(MockTransport::new());
		let (engine, pipeline) = engine(transport.clone(), config("new_heads = false"));
		let running = tokio::spawn({
			let engine = engine.clone();
			async move {
				engine
					.run_until(async { Err(std::io::Error::other("no signal handler")) })
					.await
			}
		});

		engine
			.trigger_run(RunRequest {
				job_id: "job".to_string(),
				payload: json!(null),
			})
			.await
			.unwrap();
		eventually(|| pipeline.events().len() == 1).await;
		assert!(!engine.queue().is_closed());

		engine.shutdown_token().cancel();
		running.await.unwrap().unwrap();
	}
}

//! Transport backed by an alloy provider.
//!
//! The endpoint scheme picks the wire: `http(s)://` for plain request and
//! response, `ws(s)://` for a persistent connection that also carries
//! `eth_subscribe` push notifications through alloy's pubsub frontend.

use crate::{ClientError, RawSubscription, Transport};
use alloy_json_rpc::RpcError;
use alloy_primitives::B256;
use alloy_provider::{Provider, RootProvider};
use alloy_pubsub::Subscription;
use alloy_transport::{BoxTransport, TransportError};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Maps alloy's error taxonomy onto client errors.
///
/// Error objects returned by the node keep their code and message, with any
/// `data` member appended so revert reasons survive. Everything that happens
/// below the JSON-RPC layer is a transport failure.
pub(crate) fn classify(error: TransportError) -> ClientError {
	match error {
		RpcError::ErrorResp(payload) => {
			let mut message = payload.message.to_string();
			if let Some(data) = payload.data.as_deref() {
				let data = serde_json::from_str::<String>(data.get())
					.unwrap_or_else(|_| data.get().to_string());
				message = format!("{} ({})", message, data);
			}
			ClientError::Rpc {
				code: payload.code,
				message,
			}
		}
		RpcError::NullResp => ClientError::Decode("null response".to_string()),
		RpcError::SerError(e) => ClientError::Decode(format!("request encoding: {}", e)),
		RpcError::DeserError { err, text } => {
			ClientError::Decode(format!("{} in response {}", err, text))
		}
		RpcError::UnsupportedFeature(feature) => ClientError::Unsupported(feature.to_string()),
		other => ClientError::Transport(other.to_string()),
	}
}

struct ActiveSubscription {
	local_id: B256,
	cancel: CancellationToken,
}

pub struct AlloyTransport {
	provider: RootProvider<BoxTransport>,
	timeout: Duration,
	active: Mutex<HashMap<String, ActiveSubscription>>,
}

impl AlloyTransport {
	/// Connects to `url`. WebSocket endpoints are dialed here, HTTP endpoints
	/// on the first request.
	pub async fn connect(url: &str, timeout: Duration) -> Result<Self, ClientError> {
		let provider = tokio::time::timeout(timeout, RootProvider::connect_builtin(url))
			.await
			.map_err(|_| ClientError::Transport(format!("Connecting to {} timed out", url)))?
			.map_err(classify)?;

		tracing::debug!(%url, "Connected to chain node");
		Ok(Self {
			provider,
			timeout,
			active: Mutex::new(HashMap::new()),
		})
	}

	fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveSubscription>> {
		self.active.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

#[async_trait]
impl Transport for AlloyTransport {
	async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
		let call = self
			.provider
			.client()
			.request::<_, Value>(method.to_string(), params);

		tokio::time::timeout(self.timeout, call)
			.await
			.map_err(|_| ClientError::Transport(format!("{} timed out", method)))?
			.map_err(classify)
	}

	fn supports_subscriptions(&self) -> bool {
		self.provider.client().pubsub_frontend().is_some()
	}

	async fn subscribe(&self, params: Value) -> Result<RawSubscription, ClientError> {
		if !self.supports_subscriptions() {
			return Err(ClientError::Unsupported("eth_subscribe".to_string()));
		}

		let subscription: Subscription<Value> = tokio::time::timeout(
			self.timeout,
			self.provider.subscribe::<_, Value>(params),
		)
		.await
		.map_err(|_| ClientError::Transport("eth_subscribe timed out".to_string()))?
		.map_err(classify)?;

		let local_id = *subscription.local_id();
		let id = local_id.to_string();
		let (sink, notifications) = mpsc::unbounded_channel();
		let (failure_tx, failure) = watch::channel(None);
		let cancel = CancellationToken::new();

		let forward_cancel = cancel.clone();
		let forward_id = id.clone();
		tokio::spawn(async move {
			let mut stream = subscription.into_stream();
			loop {
				tokio::select! {
					_ = forward_cancel.cancelled() => return,
					item = stream.next() => match item {
						Some(value) => {
							if sink.send(value).is_err() {
								return;
							}
						}
						None => {
							tracing::warn!(
								subscription = %forward_id,
								"Subscription stream ended by the node connection"
							);
							failure_tx
								.send_replace(Some("subscription channel closed".to_string()));
							return;
						}
					},
				}
			}
		});

		self.active()
			.insert(id.clone(), ActiveSubscription { local_id, cancel });

		Ok(RawSubscription {
			id,
			notifications,
			failure,
		})
	}

	async fn unsubscribe(&self, id: &str) -> Result<(), ClientError> {
		let Some(entry) = self.active().remove(id) else {
			return Ok(());
		};
		entry.cancel.cancel();

		match self.provider.client().pubsub_frontend() {
			Some(frontend) => frontend.unsubscribe(entry.local_id).map_err(classify),
			None => Ok(()),
		}
	}

	async fn close(&self) {
		let drained: Vec<_> = self.active().drain().collect();
		for (id, entry) in drained {
			entry.cancel.cancel();
			if let Some(frontend) = self.provider.client().pubsub_frontend() {
				if let Err(e) = frontend.unsubscribe(entry.local_id) {
					tracing::debug!(subscription = %id, error = %e, "Unsubscribe on close failed");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloy_json_rpc::ErrorPayload;
	use alloy_transport::TransportErrorKind;
	use serde_json::json;

	#[test]
	fn test_error_object_keeps_code_and_data() {
		let payload: ErrorPayload = serde_json::from_value(json!({
			"code": 3,
			"message": "execution reverted",
			"data": "0x08c379a0"
		}))
		.unwrap();

		match classify(RpcError::ErrorResp(payload)) {
			ClientError::Rpc { code, message } => {
				assert_eq!(code, 3);
				assert_eq!(message, "execution reverted (0x08c379a0)");
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn test_lower_layer_failures_are_transport_errors() {
		let error = classify(TransportErrorKind::custom_str("connection reset"));
		assert!(matches!(error, ClientError::Transport(_)));
		assert!(error.is_retryable());

		assert!(matches!(classify(RpcError::NullResp), ClientError::Decode(_)));
		assert!(!classify(RpcError::NullResp).is_retryable());
	}

	#[tokio::test]
	async fn test_http_endpoint_has_no_push() {
		let transport = AlloyTransport::connect("http://127.0.0.1:1", Duration::from_secs(2))
			.await
			.unwrap();
		assert!(!transport.supports_subscriptions());
		assert!(matches!(
			transport.subscribe(json!(["newHeads"])).await,
			Err(ClientError::Unsupported(_))
		));

		// Nothing listens on port 1
		assert!(matches!(
			transport.request("eth_blockNumber", json!([])).await,
			Err(ClientError::Transport(_))
		));
	}
}

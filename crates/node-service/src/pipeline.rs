//! Job pipeline used by the standalone service.
//!
//! Job execution lives outside this binary; the service logs every event and
//! transaction outcome so the chain layer can run and be observed on its own.

use async_trait::async_trait;
use node_core::{EngineError, JobPipeline, TransactionConsumer};
use node_types::{truncate_id, RunEvent, TxNotification};

pub struct LoggingPipeline;

#[async_trait]
impl JobPipeline for LoggingPipeline {
	async fn handle_event(&self, event: &RunEvent) -> Result<(), EngineError> {
		match event {
			RunEvent::NewHead(head) => {
				tracing::debug!(number = head.number, hash = %truncate_id(&head.hash.to_string()), "New head");
			}
			RunEvent::Log(log) => {
				tracing::info!(
					address = %log.address,
					block = ?log.block_number,
					removed = log.removed,
					"Log event"
				);
			}
			RunEvent::RunRequest(request) => {
				tracing::info!(job_id = %request.job_id, "Run requested");
			}
		}
		Ok(())
	}
}

#[async_trait]
impl TransactionConsumer for LoggingPipeline {
	async fn on_notification(&self, notification: &TxNotification) {
		match notification {
			TxNotification::Confirmed {
				nonce, hash, receipt, ..
			} => {
				tracing::info!(
					nonce,
					tx_hash = %truncate_id(&hash.to_string()),
					block = receipt.block_number,
					success = receipt.success(),
					"Transaction confirmed"
				);
			}
			TxNotification::Dropped { nonce, cause, .. } => {
				tracing::warn!(nonce, %cause, "Transaction dropped");
			}
			TxNotification::Rejected {
				nonce,
				cause,
				message,
				..
			} => {
				tracing::warn!(nonce, %cause, %message, "Transaction rejected");
			}
		}
	}
}

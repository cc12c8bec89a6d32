//! Event types carried through the event queue.
//!
//! Producers (subscriptions, pollers, the job pipeline) wrap what they
//! observe in a [`RunEvent`] and hand it to the queue; the single consumer
//! loop dispatches on the variant.

use crate::{BlockHeader, LogEvent};
use serde::{Deserialize, Serialize};

/// Payload of the event queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEvent {
	/// A new chain head was observed.
	NewHead(BlockHeader),
	/// A log matching a subscribed filter was delivered.
	Log(LogEvent),
	/// A job run was requested by an external trigger.
	RunRequest(RunRequest),
}

impl RunEvent {
	/// Short label used in log lines.
	pub fn kind(&self) -> &'static str {
		match self {
			RunEvent::NewHead(_) => "new_head",
			RunEvent::Log(_) => "log",
			RunEvent::RunRequest(_) => "run_request",
		}
	}
}

/// Opaque job trigger supplied by the job pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
	/// Identifier of the job to run.
	pub job_id: String,
	/// Trigger parameters, passed through untouched.
	#[serde(default)]
	pub payload: serde_json::Value,
}

//! Configuration module for the oracle node chain layer.
//!
//! This module provides structures and utilities for managing node
//! configuration. Configuration is loaded from TOML, `${VAR}` and
//! `${VAR:-default}` references are resolved from the environment, and every
//! section is validated before the configuration is handed out.

use node_types::{LogFilter, SecretString};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Malformed TOML or a type mismatch in a field.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Well-formed but unusable values, or unresolved placeholders.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// The full error embeds the whole input document
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure for the node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity of this node instance.
	pub node: NodeConfig,
	/// Connection to the chain node.
	pub transport: TransportConfig,
	/// Nonce, retry and confirmation policy.
	#[serde(default)]
	pub transactions: TransactionsConfig,
	/// Event queue sizing and overflow policy.
	#[serde(default)]
	pub queue: QueueConfig,
	/// Storage backend for pending transaction records.
	pub storage: StorageConfig,
	/// Push subscriptions and the polling fallback.
	#[serde(default)]
	pub subscriptions: SubscriptionsConfig,
	/// Local signing key, when the node signs its own transactions.
	pub account: Option<AccountConfig>,
}

/// Configuration specific to the node instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
	/// Unique identifier for this node instance.
	pub id: String,
	/// Expected chain ID; checked against the remote node on startup.
	pub chain_id: Option<u64>,
}

/// Configuration for the JSON-RPC transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
	/// HTTP endpoint for request/response calls.
	pub http_url: String,
	/// WebSocket endpoint; enables push subscriptions when set.
	pub ws_url: Option<String>,
	/// Per-request timeout in seconds.
	#[serde(default = "default_request_timeout_seconds")]
	pub request_timeout_seconds: u64,
}

impl TransportConfig {
	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_seconds)
	}
}

fn default_request_timeout_seconds() -> u64 {
	30
}

/// What to do with a transaction that saw no receipt for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StuckPolicy {
	/// Mark the transaction dropped and notify consumers.
	Abandon,
	/// Re-sign the same nonce with the gas price raised by `percent`.
	BumpFee {
		#[serde(default = "default_bump_percent")]
		percent: u64,
	},
}

impl Default for StuckPolicy {
	fn default() -> Self {
		StuckPolicy::Abandon
	}
}

/// Most nodes refuse replacements that raise the price by less than 10%.
fn default_bump_percent() -> u64 {
	10
}

/// Transaction manager policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransactionsConfig {
	/// Blocks required on top of a receipt's block before it is final.
	#[serde(default = "default_confirmations")]
	pub min_confirmations: u64,
	/// Ceiling on send attempts per transaction.
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	/// First retry delay after a transport failure.
	#[serde(default = "default_backoff_initial_ms")]
	pub backoff_initial_ms: u64,
	/// Upper bound on a single retry delay.
	#[serde(default = "default_backoff_max_ms")]
	pub backoff_max_ms: u64,
	/// Head advances without a receipt before a transaction is stuck.
	#[serde(default = "default_stuck_after_heads")]
	pub stuck_after_heads: u32,
	#[serde(default)]
	pub stuck_policy: StuckPolicy,
}

impl Default for TransactionsConfig {
	fn default() -> Self {
		Self {
			min_confirmations: default_confirmations(),
			max_attempts: default_max_attempts(),
			backoff_initial_ms: default_backoff_initial_ms(),
			backoff_max_ms: default_backoff_max_ms(),
			stuck_after_heads: default_stuck_after_heads(),
			stuck_policy: StuckPolicy::default(),
		}
	}
}

impl TransactionsConfig {
	pub fn backoff_initial(&self) -> Duration {
		Duration::from_millis(self.backoff_initial_ms)
	}

	pub fn backoff_max(&self) -> Duration {
		Duration::from_millis(self.backoff_max_ms)
	}
}

fn default_confirmations() -> u64 {
	12
}

fn default_max_attempts() -> u32 {
	5
}

fn default_backoff_initial_ms() -> u64 {
	500
}

fn default_backoff_max_ms() -> u64 {
	30_000
}

fn default_stuck_after_heads() -> u32 {
	50
}

/// Behaviour of a full event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
	/// Producers wait for space up to the send timeout, then fail.
	Block,
	/// The oldest buffered event is evicted to make room.
	DropOldest,
}

/// Event queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
	#[serde(default = "default_queue_capacity")]
	pub capacity: usize,
	#[serde(default = "default_overflow")]
	pub overflow: OverflowPolicy,
	/// Longest a producer may wait under the `block` policy.
	#[serde(default = "default_send_timeout_ms")]
	pub send_timeout_ms: u64,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			capacity: default_queue_capacity(),
			overflow: default_overflow(),
			send_timeout_ms: default_send_timeout_ms(),
		}
	}
}

impl QueueConfig {
	pub fn send_timeout(&self) -> Duration {
		Duration::from_millis(self.send_timeout_ms)
	}
}

fn default_queue_capacity() -> usize {
	1024
}

fn default_overflow() -> OverflowPolicy {
	OverflowPolicy::Block
}

fn default_send_timeout_ms() -> u64 {
	5_000
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Event sources feeding the queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionsConfig {
	/// Subscribe to new heads (or poll for them without push support).
	#[serde(default = "default_true")]
	pub new_heads: bool,
	/// Log filters to subscribe to.
	#[serde(default)]
	pub logs: Vec<LogFilter>,
	/// Head polling interval used when the transport has no push support.
	#[serde(default = "default_poll_interval_seconds")]
	pub poll_interval_seconds: u64,
}

impl Default for SubscriptionsConfig {
	fn default() -> Self {
		Self {
			new_heads: true,
			logs: Vec::new(),
			poll_interval_seconds: default_poll_interval_seconds(),
		}
	}
}

impl SubscriptionsConfig {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_secs(self.poll_interval_seconds)
	}
}

fn default_true() -> bool {
	true
}

fn default_poll_interval_seconds() -> u64 {
	5
}

/// Local signing account.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
	/// Hex encoded private key; usually `${NODE_PRIVATE_KEY}`.
	pub private_key: SecretString,
}

const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// `${NAME}` or `${NAME:-fallback}`; bounded repetition keeps matching linear.
static ENV_PLACEHOLDER: Lazy<Option<Regex>> = Lazy::new(|| {
	Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}").ok()
});

/// Substitutes environment placeholders in raw configuration text.
///
/// A placeholder without a fallback whose variable is unset is an error.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	if input.len() > MAX_CONFIG_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_CONFIG_SIZE
		)));
	}

	let placeholders = ENV_PLACEHOLDER
		.as_ref()
		.ok_or_else(|| ConfigError::Parse("invalid placeholder pattern".into()))?;

	let mut resolved = String::with_capacity(input.len());
	let mut copied_to = 0;
	for caps in placeholders.captures_iter(input) {
		let (Some(placeholder), Some(name)) = (caps.get(0), caps.get(1)) else {
			continue;
		};
		let value = match (std::env::var(name.as_str()), caps.get(2)) {
			(Ok(value), _) => value,
			(Err(_), Some(fallback)) => fallback.as_str().to_string(),
			(Err(_), None) => {
				return Err(ConfigError::Validation(format!(
					"Environment variable '{}' not found",
					name.as_str()
				)));
			}
		};
		resolved.push_str(&input[copied_to..placeholder.start()]);
		resolved.push_str(&value);
		copied_to = placeholder.end();
	}
	resolved.push_str(&input[copied_to..]);

	Ok(resolved)
}

impl Config {
	/// Loads, resolves and validates a configuration file.
	pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let content = tokio::fs::read_to_string(path.as_ref()).await?;
		content.parse()
	}

	/// Validates every section.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.node.id.is_empty() {
			return Err(ConfigError::Validation("Node ID cannot be empty".into()));
		}

		// Transport
		if !(self.transport.http_url.starts_with("http://")
			|| self.transport.http_url.starts_with("https://"))
		{
			return Err(ConfigError::Validation(format!(
				"transport.http_url must be an http(s) URL, got '{}'",
				self.transport.http_url
			)));
		}
		if let Some(ref ws_url) = self.transport.ws_url {
			if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
				return Err(ConfigError::Validation(format!(
					"transport.ws_url must be a ws(s) URL, got '{}'",
					ws_url
				)));
			}
		}
		if self.transport.request_timeout_seconds == 0 {
			return Err(ConfigError::Validation(
				"transport.request_timeout_seconds must be greater than 0".into(),
			));
		}

		// Transactions
		let txs = &self.transactions;
		if txs.min_confirmations == 0 {
			return Err(ConfigError::Validation(
				"min_confirmations must be at least 1".into(),
			));
		}
		if txs.min_confirmations > 100 {
			return Err(ConfigError::Validation(
				"min_confirmations cannot exceed 100".into(),
			));
		}
		if txs.max_attempts == 0 {
			return Err(ConfigError::Validation(
				"transactions.max_attempts must be at least 1".into(),
			));
		}
		if txs.backoff_initial_ms == 0 || txs.backoff_max_ms < txs.backoff_initial_ms {
			return Err(ConfigError::Validation(
				"transactions backoff must satisfy 0 < backoff_initial_ms <= backoff_max_ms".into(),
			));
		}
		if txs.stuck_after_heads == 0 {
			return Err(ConfigError::Validation(
				"transactions.stuck_after_heads must be at least 1".into(),
			));
		}
		if let StuckPolicy::BumpFee { percent } = txs.stuck_policy {
			if percent < 10 {
				return Err(ConfigError::Validation(format!(
					"stuck_policy.percent must be at least 10, got {}",
					percent
				)));
			}
		}

		// Queue
		if self.queue.capacity == 0 {
			return Err(ConfigError::Validation(
				"queue.capacity must be greater than 0".into(),
			));
		}
		if self.queue.send_timeout_ms == 0 {
			return Err(ConfigError::Validation(
				"queue.send_timeout_ms must be greater than 0".into(),
			));
		}

		// Storage
		if self.storage.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one storage implementation must be configured".into(),
			));
		}
		if !self
			.storage
			.implementations
			.contains_key(&self.storage.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' not found in implementations",
				self.storage.primary
			)));
		}

		// Subscriptions
		if self.subscriptions.poll_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"subscriptions.poll_interval_seconds must be greater than 0".into(),
			));
		}

		if let Some(ref account) = self.account {
			if account.private_key.is_empty() {
				return Err(ConfigError::Validation(
					"account.private_key cannot be empty".into(),
				));
			}
		}

		Ok(())
	}
}

/// Parses configuration from a TOML string.
///
/// Environment variables are resolved and the configuration is validated
/// after parsing.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}

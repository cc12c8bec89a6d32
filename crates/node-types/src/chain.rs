//! Chain data seen by the node.
//!
//! Responses are decoded with the `alloy-rpc-types` definitions and then
//! narrowed into these types, which carry only what the node acts on.

use crate::quantity::{self, QuantityError};
use crate::TxHash;
use alloy_primitives::{Address, Bytes, B256};
use alloy_rpc_types::{BlockNumberOrTag, Filter, Header, Log, TransactionReceipt};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Positions a log filter can constrain.
pub const MAX_TOPICS: usize = 4;

/// A chain object that cannot be narrowed into the node's view of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainDataError {
	#[error("receipt for {0} carries no block number or hash")]
	UnminedReceipt(TxHash),
	#[error("filter constrains {0} topic positions, at most 4 are allowed")]
	TooManyTopics(usize),
}

/// Header fields of a block.
///
/// Used both as the polling anchor for confirmations and as the payload of a
/// `newHeads` subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
	pub number: u64,
	pub hash: B256,
	pub parent_hash: B256,
	pub timestamp: u64,
}

impl From<Header> for BlockHeader {
	fn from(header: Header) -> Self {
		Self {
			number: header.number,
			hash: header.hash,
			parent_hash: header.parent_hash,
			timestamp: header.timestamp,
		}
	}
}

/// Block selector for `eth_getBlockByNumber` and filter ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockTag {
	Number(u64),
	Latest,
	Earliest,
	Pending,
}

impl fmt::Display for BlockTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BlockTag::Number(n) => write!(f, "{}", quantity::encode_u64(*n)),
			BlockTag::Latest => write!(f, "latest"),
			BlockTag::Earliest => write!(f, "earliest"),
			BlockTag::Pending => write!(f, "pending"),
		}
	}
}

impl FromStr for BlockTag {
	type Err = QuantityError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"latest" => Ok(BlockTag::Latest),
			"earliest" => Ok(BlockTag::Earliest),
			"pending" => Ok(BlockTag::Pending),
			other => quantity::decode_u64(other).map(BlockTag::Number),
		}
	}
}

impl From<u64> for BlockTag {
	fn from(number: u64) -> Self {
		BlockTag::Number(number)
	}
}

impl From<BlockTag> for BlockNumberOrTag {
	fn from(tag: BlockTag) -> Self {
		match tag {
			BlockTag::Number(n) => BlockNumberOrTag::Number(n),
			BlockTag::Latest => BlockNumberOrTag::Latest,
			BlockTag::Earliest => BlockNumberOrTag::Earliest,
			BlockTag::Pending => BlockNumberOrTag::Pending,
		}
	}
}

// Tags are written the way operators type them in configuration files.
impl Serialize for BlockTag {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for BlockTag {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		raw.parse().map_err(serde::de::Error::custom)
	}
}

/// A contract log, from `eth_getLogs` or a `logs` subscription.
///
/// Block and transaction context are absent for pending logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
	pub address: Address,
	pub topics: Vec<B256>,
	pub data: Bytes,
	pub block_number: Option<u64>,
	pub block_hash: Option<B256>,
	pub transaction_hash: Option<TxHash>,
	pub log_index: Option<u64>,
	/// Set when the log was removed by a reorg.
	pub removed: bool,
}

impl From<Log> for LogEvent {
	fn from(log: Log) -> Self {
		Self {
			address: log.inner.address,
			topics: log.inner.data.topics().to_vec(),
			data: log.inner.data.data.clone(),
			block_number: log.block_number,
			block_hash: log.block_hash,
			transaction_hash: log.transaction_hash,
			log_index: log.log_index,
			removed: log.removed,
		}
	}
}

/// Log query: emitting addresses, positional topic pattern and block range.
///
/// A `None` topic position matches anything; `Some(vec)` matches any of the
/// listed values at that position. Read from the `[[subscriptions.logs]]`
/// configuration tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
	#[serde(rename = "address", default, skip_serializing_if = "Vec::is_empty")]
	pub addresses: Vec<Address>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub topics: Vec<Option<Vec<B256>>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub from_block: Option<BlockTag>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub to_block: Option<BlockTag>,
}

impl LogFilter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn address(mut self, address: Address) -> Self {
		self.addresses.push(address);
		self
	}

	/// Restricts topic position `index` to any of `values`.
	pub fn topic(mut self, index: usize, values: Vec<B256>) -> Self {
		if self.topics.len() <= index {
			self.topics.resize(index + 1, None);
		}
		self.topics[index] = Some(values);
		self
	}

	pub fn from_block(mut self, tag: impl Into<BlockTag>) -> Self {
		self.from_block = Some(tag.into());
		self
	}

	pub fn to_block(mut self, tag: impl Into<BlockTag>) -> Self {
		self.to_block = Some(tag.into());
		self
	}

	/// Whether a log matches the address and topic pattern. The block range
	/// is enforced by the node and not checked here.
	pub fn matches(&self, log: &LogEvent) -> bool {
		if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
			return false;
		}
		self.topics.iter().enumerate().all(|(i, expected)| match expected {
			None => true,
			Some(values) => log.topics.get(i).is_some_and(|t| values.contains(t)),
		})
	}

	/// Builds the `eth_getLogs` / `eth_subscribe` filter object.
	pub fn to_rpc(&self) -> Result<Filter, ChainDataError> {
		if self.topics.len() > MAX_TOPICS {
			return Err(ChainDataError::TooManyTopics(self.topics.len()));
		}

		let mut filter = Filter::new();
		if !self.addresses.is_empty() {
			filter = filter.address(self.addresses.clone());
		}
		for (position, values) in self.topics.iter().enumerate() {
			if let Some(values) = values {
				filter.topics[position] = values.clone().into();
			}
		}
		if let Some(from) = self.from_block {
			filter = filter.from_block(BlockNumberOrTag::from(from));
		}
		if let Some(to) = self.to_block {
			filter = filter.to_block(BlockNumberOrTag::from(to));
		}
		Ok(filter)
	}
}

/// Execution outcome recorded in a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
	Success,
	Failure,
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
	pub transaction_hash: TxHash,
	pub status: TxStatus,
	pub block_number: u64,
	pub block_hash: B256,
	pub gas_used: u64,
}

impl TxReceipt {
	pub fn success(&self) -> bool {
		self.status == TxStatus::Success
	}

	/// Blocks mined on top of the receipt's block, as seen from `head`.
	pub fn depth_at(&self, head: u64) -> u64 {
		head.saturating_sub(self.block_number)
	}
}

impl TryFrom<TransactionReceipt> for TxReceipt {
	type Error = ChainDataError;

	fn try_from(receipt: TransactionReceipt) -> Result<Self, Self::Error> {
		let (Some(block_number), Some(block_hash)) = (receipt.block_number, receipt.block_hash)
		else {
			return Err(ChainDataError::UnminedReceipt(receipt.transaction_hash));
		};
		Ok(Self {
			transaction_hash: receipt.transaction_hash,
			status: if receipt.status() {
				TxStatus::Success
			} else {
				TxStatus::Failure
			},
			block_number,
			block_hash,
			gas_used: u64::try_from(receipt.gas_used).unwrap_or(u64::MAX),
		})
	}
}

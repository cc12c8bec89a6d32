//! Wei denominated amounts.
//!
//! Chain balances routinely exceed 64 bits, so amounts are carried as `U256`
//! and every arithmetic operation is checked.

use crate::quantity::{self, QuantityError};
use alloy_primitives::utils::format_ether;
use alloy_primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A non-negative amount of wei.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WeiAmount(U256);

impl WeiAmount {
	pub const ZERO: Self = Self(U256::ZERO);

	pub fn new(value: U256) -> Self {
		Self(value)
	}

	pub fn as_u256(&self) -> U256 {
		self.0
	}

	pub fn is_zero(&self) -> bool {
		self.0.is_zero()
	}

	pub fn checked_add(self, other: Self) -> Option<Self> {
		self.0.checked_add(other.0).map(Self)
	}

	pub fn checked_sub(self, other: Self) -> Option<Self> {
		self.0.checked_sub(other.0).map(Self)
	}

	/// Multiplies by a unit count, e.g. a per-gas price by a gas limit.
	pub fn checked_mul(self, factor: u64) -> Option<Self> {
		self.0.checked_mul(U256::from(factor)).map(Self)
	}

	/// Increases the amount by `percent`, rounding up so that a bump of a
	/// small non-zero amount always changes it.
	pub fn bumped_by_percent(self, percent: u64) -> Option<Self> {
		let scaled = self.0.checked_mul(U256::from(100u64.checked_add(percent)?))?;
		let hundred = U256::from(100u64);
		let (quotient, remainder) = scaled.div_rem(hundred);
		let bumped = if remainder.is_zero() {
			quotient
		} else {
			quotient.checked_add(U256::from(1u64))?
		};
		Some(Self(bumped))
	}

	/// Encodes the amount as a `0x` hex quantity.
	pub fn to_hex(&self) -> String {
		quantity::encode_u256(self.0)
	}

	/// Decodes a `0x` hex quantity.
	pub fn from_hex(input: &str) -> Result<Self, QuantityError> {
		quantity::decode_u256(input).map(Self)
	}

	/// Formats the amount in ether, trimming trailing zeros.
	pub fn to_ether_string(&self) -> String {
		let formatted = format_ether(self.0);
		match formatted.split_once('.') {
			Some((whole, fraction)) => match fraction.trim_end_matches('0') {
				"" => whole.to_string(),
				fraction => format!("{}.{}", whole, fraction),
			},
			None => formatted,
		}
	}
}

impl From<u64> for WeiAmount {
	fn from(value: u64) -> Self {
		Self(U256::from(value))
	}
}

impl From<u128> for WeiAmount {
	fn from(value: u128) -> Self {
		Self(U256::from(value))
	}
}

impl From<U256> for WeiAmount {
	fn from(value: U256) -> Self {
		Self(value)
	}
}

impl fmt::Display for WeiAmount {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl Serialize for WeiAmount {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for WeiAmount {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		Self::from_hex(&raw).map_err(serde::de::Error::custom)
	}
}

/// Native balance expressed in ether.
///
/// Carries the exact wei value; only the display is denomination converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthBalance(WeiAmount);

impl EthBalance {
	pub fn new(wei: WeiAmount) -> Self {
		Self(wei)
	}

	pub fn as_wei(&self) -> WeiAmount {
		self.0
	}
}

impl fmt::Display for EthBalance {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.to_ether_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_hex_round_trip() {
		let values = [
			WeiAmount::ZERO,
			WeiAmount::from(1u64),
			WeiAmount::from(u64::MAX),
			WeiAmount::new((U256::from(1u64) << 128) + U256::from(7u64)),
		];
		for value in values {
			assert_eq!(WeiAmount::from_hex(&value.to_hex()).unwrap(), value);
		}
	}

	#[test]
	fn test_arithmetic_never_truncates() {
		let max = WeiAmount::new(U256::MAX);
		assert_eq!(max.checked_add(WeiAmount::from(1u64)), None);
		assert_eq!(WeiAmount::ZERO.checked_sub(WeiAmount::from(1u64)), None);

		let big = WeiAmount::from(u64::MAX);
		let sum = big.checked_add(big).unwrap();
		assert_eq!(sum.to_string(), "36893488147419103230");

		assert_eq!(
			WeiAmount::from(20u64).checked_mul(21_000),
			Some(WeiAmount::from(420_000u64))
		);
		assert_eq!(max.checked_mul(2), None);
	}

	#[test]
	fn test_bumped_by_percent() {
		assert_eq!(
			WeiAmount::from(1_000u64).bumped_by_percent(10),
			Some(WeiAmount::from(1_100u64))
		);
		// Rounds up so that tiny prices still move
		assert_eq!(WeiAmount::from(1u64).bumped_by_percent(10), Some(WeiAmount::from(2u64)));
		assert_eq!(WeiAmount::new(U256::MAX).bumped_by_percent(10), None);
	}

	#[test]
	fn test_ether_display() {
		let balance = EthBalance::new(WeiAmount::from(1_500_000_000_000_000_000u64));
		assert_eq!(balance.to_string(), "1.5");
		assert_eq!(balance.as_wei().to_string(), "1500000000000000000");
		assert_eq!(WeiAmount::from(1u64).to_ether_string(), "0.000000000000000001");
		assert_eq!(WeiAmount::ZERO.to_ether_string(), "0");
		assert_eq!(
			WeiAmount::new("340282366920938463463374607431768211463".parse::<U256>().unwrap()).to_ether_string(),
			"340282366920938463463.374607431768211463"
		);
	}

	#[test]
	fn test_serde_uses_hex() {
		let json = serde_json::to_string(&WeiAmount::from(255u64)).unwrap();
		assert_eq!(json, "\"0xff\"");
		let back: WeiAmount = serde_json::from_str(&json).unwrap();
		assert_eq!(back, WeiAmount::from(255u64));
		assert!(serde_json::from_str::<WeiAmount>("\"0x\"").is_err());
	}
}

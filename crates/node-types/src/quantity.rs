//! Strict codec for JSON-RPC quantities.
//!
//! Every numeric value on the wire is a `0x`-prefixed hex string. Decoding is
//! strict: a missing prefix, an empty digit string, a non-hex character or a
//! value wider than the target type is an error, never a silent zero.

use alloy_primitives::U256;
use thiserror::Error;

/// Errors produced while decoding a hex quantity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
	#[error("quantity {0:?} is missing the 0x prefix")]
	MissingPrefix(String),
	#[error("quantity has no digits")]
	Empty,
	#[error("quantity {0:?} contains a non-hex digit")]
	InvalidDigit(String),
	#[error("quantity {0:?} overflows {1} bits")]
	Overflow(String, usize),
}

/// Splits off the prefix and validates the remaining digits.
fn digits(input: &str) -> Result<&str, QuantityError> {
	let digits = input
		.strip_prefix("0x")
		.or_else(|| input.strip_prefix("0X"))
		.ok_or_else(|| QuantityError::MissingPrefix(input.to_string()))?;

	if digits.is_empty() {
		return Err(QuantityError::Empty);
	}
	if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
		return Err(QuantityError::InvalidDigit(input.to_string()));
	}

	// Leading zeros carry no value but must not count towards the width check
	let significant = digits.trim_start_matches('0');
	Ok(if significant.is_empty() { "0" } else { significant })
}

/// Decodes a quantity that must fit in 64 bits.
pub fn decode_u64(input: &str) -> Result<u64, QuantityError> {
	let digits = digits(input)?;
	if digits.len() > 16 {
		return Err(QuantityError::Overflow(input.to_string(), 64));
	}
	u64::from_str_radix(digits, 16).map_err(|_| QuantityError::InvalidDigit(input.to_string()))
}

/// Decodes a quantity that must fit in 256 bits.
pub fn decode_u256(input: &str) -> Result<U256, QuantityError> {
	let digits = digits(input)?;
	if digits.len() > 64 {
		return Err(QuantityError::Overflow(input.to_string(), 256));
	}
	U256::from_str_radix(digits, 16).map_err(|_| QuantityError::InvalidDigit(input.to_string()))
}

pub fn encode_u64(value: u64) -> String {
	format!("0x{:x}", value)
}

pub fn encode_u256(value: U256) -> String {
	format!("0x{:x}", value)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_decode_u64() {
		assert_eq!(decode_u64("0x0").unwrap(), 0);
		assert_eq!(decode_u64("0x5").unwrap(), 5);
		assert_eq!(decode_u64("0X1a").unwrap(), 26);
		assert_eq!(decode_u64("0x000000000000000000ff").unwrap(), 255);
		assert_eq!(decode_u64("0xffffffffffffffff").unwrap(), u64::MAX);
	}

	#[test]
	fn test_malformed_quantities_are_rejected() {
		assert_eq!(decode_u64("0x"), Err(QuantityError::Empty));
		assert!(matches!(decode_u64("12"), Err(QuantityError::MissingPrefix(_))));
		assert!(matches!(decode_u64(""), Err(QuantityError::MissingPrefix(_))));
		assert!(matches!(decode_u64("0xzz"), Err(QuantityError::InvalidDigit(_))));
		assert!(matches!(decode_u64("0x-1"), Err(QuantityError::InvalidDigit(_))));
		assert!(matches!(
			decode_u64("0x10000000000000000"),
			Err(QuantityError::Overflow(_, 64))
		));
		assert!(matches!(decode_u256(&format!("0x1{}", "0".repeat(64))), Err(QuantityError::Overflow(_, 256))));
	}

	#[test]
	fn test_u256_round_trip() {
		let values = [
			U256::ZERO,
			U256::from(1u64),
			U256::from(u64::MAX),
			(U256::from(1u64) << 128) + U256::from(7u64),
			U256::MAX,
		];
		for value in values {
			let encoded = encode_u256(value);
			assert!(encoded.starts_with("0x"));
			assert_eq!(decode_u256(&encoded).unwrap(), value);
		}
		assert_eq!(encode_u256(U256::ZERO), "0x0");
	}
}

//! Typed contract call payloads.
//!
//! Calls are built from a tagged payload rather than from opaque bytes so the
//! target arguments (for example the holder of a `balanceOf` query) are known
//! statically. ABI encoding is generated from the Solidity signatures in
//! [`erc20`].

use alloy_primitives::{Address, Bytes};
use alloy_sol_types::SolCall;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Token contract interface queried by the node.
pub mod erc20 {
	alloy_sol_types::sol! {
		function balanceOf(address holder) external view returns (uint256 balance);
	}
}

/// First four bytes of the keccak hash of a method signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionSelector(pub [u8; 4]);

impl FunctionSelector {
	pub const BALANCE_OF: Self = Self(<erc20::balanceOfCall as SolCall>::SELECTOR);

	pub fn as_bytes(&self) -> &[u8; 4] {
		&self.0
	}
}

impl fmt::Display for FunctionSelector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "0x{}", hex::encode(self.0))
	}
}

/// Payload of an `eth_call`, tagged by call kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPayload {
	/// ERC-20 `balanceOf(holder)`.
	BalanceOf { holder: Address },
}

impl CallPayload {
	/// Encodes the payload into calldata.
	pub fn encode(&self) -> Bytes {
		match self {
			CallPayload::BalanceOf { holder } => {
				erc20::balanceOfCall { holder: *holder }.abi_encode().into()
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloy_primitives::U256;

	#[test]
	fn test_balance_of_payload_keeps_leading_zero_bytes() {
		let holder: Address = "0x0000000000000000000000000000000000c0ffee".parse().unwrap();
		let data = CallPayload::BalanceOf { holder }.encode();

		assert_eq!(data.len(), 36);
		assert_eq!(&data[..4], &[0x70, 0xa0, 0x82, 0x31]);
		assert_eq!(&data[data.len() - 20..], holder.as_slice());
		assert!(data[4..16].iter().all(|b| *b == 0));
	}

	#[test]
	fn test_balance_of_selector_and_return() {
		assert_eq!(FunctionSelector::BALANCE_OF.to_string(), "0x70a08231");

		let word = U256::from(1234u64).to_be_bytes::<32>();
		let decoded = erc20::balanceOfCall::abi_decode_returns(&word, true).unwrap();
		assert_eq!(decoded.balance, U256::from(1234u64));
		assert!(erc20::balanceOfCall::abi_decode_returns(&word[..31], true).is_err());
	}
}

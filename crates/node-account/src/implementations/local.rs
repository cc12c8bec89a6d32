//! Local private key signer.
//!
//! Builds legacy (EIP-155 replay protected) transactions and signs them with
//! a key held in memory.

use crate::{SignerError, TransactionSigner};
use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TxSignerSync;
use alloy_primitives::TxKind;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use node_types::{Address, SecretString, SignedTransaction, TxRequest};

/// Signer backed by a single in-memory private key.
pub struct LocalSigner {
	signer: PrivateKeySigner,
}

impl LocalSigner {
	/// Parses a hex private key, with or without the `0x` prefix.
	pub fn from_secret(key: &SecretString) -> Result<Self, SignerError> {
		let signer = key.with_exposed(|k| {
			k.parse::<PrivateKeySigner>()
				.map_err(|_| SignerError::InvalidKey("Invalid private key format".to_string()))
		})?;
		Ok(Self { signer })
	}

	pub fn address(&self) -> Address {
		self.signer.address()
	}
}

#[async_trait]
impl TransactionSigner for LocalSigner {
	fn senders(&self) -> Vec<Address> {
		vec![self.signer.address()]
	}

	async fn sign_transaction(
		&self,
		sender: Address,
		nonce: u64,
		request: &TxRequest,
	) -> Result<SignedTransaction, SignerError> {
		if sender != self.signer.address() {
			return Err(SignerError::UnknownSender(sender));
		}

		let gas_price = request
			.gas_price
			.ok_or_else(|| SignerError::IncompleteRequest("gas_price is not set".to_string()))?;
		let gas_price = u128::try_from(gas_price.as_u256()).map_err(|_| {
			SignerError::IncompleteRequest(format!("gas_price {} exceeds 128 bits", gas_price))
		})?;

		let mut tx = TxLegacy {
			chain_id: Some(request.chain_id),
			nonce,
			gas_price,
			gas_limit: request.gas_limit,
			to: request.to.map(TxKind::Call).unwrap_or(TxKind::Create),
			value: request.value.as_u256(),
			input: request.data.clone(),
		};

		let signature = self
			.signer
			.sign_transaction_sync(&mut tx)
			.map_err(|e| SignerError::SigningFailed(e.to_string()))?;

		let signed = tx.into_signed(signature);
		let hash = *signed.hash();
		let envelope = TxEnvelope::Legacy(signed);

		Ok(SignedTransaction {
			raw: envelope.encoded_2718().into(),
			hash,
			nonce,
			from: sender,
		})
	}
}

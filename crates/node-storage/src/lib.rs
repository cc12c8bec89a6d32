//! Key/value persistence for the oracle node.
//!
//! Pending transaction records are written here on every state change so
//! tracking can resume after a restart. Backends are picked by name from the
//! `[storage]` configuration section.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod implementations {
	pub mod file;
	pub mod memory;
}

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Not found")]
	NotFound,
	/// The stored document could not be encoded or decoded as JSON.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// The backend itself failed, e.g. an I/O error.
	#[error("Backend error: {0}")]
	Backend(String),
	#[error("Configuration error: {0}")]
	Configuration(String),
}

impl StorageError {
	pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
		StorageError::Backend(err.to_string())
	}
}

/// Raw byte store keyed by `namespace:id` strings.
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Returns [`StorageError::NotFound`] for missing keys.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Replaces any previous value.
	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

	/// Deleting a missing key succeeds.
	async fn delete(&self, key: &str) -> Result<(), StorageError>;

	/// Every key starting with `prefix`.
	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Builds a backend from its `[storage.implementations.<name>]` table.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Every built-in backend as `(name, factory)` pairs.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::NAME, file::create_storage as StorageFactory),
		(memory::NAME, memory::create_storage as StorageFactory),
	]
}

pub fn create_backend(
	name: &str,
	config: &toml::Value,
) -> Result<Box<dyn StorageInterface>, StorageError> {
	let (_, factory) = get_all_implementations()
		.into_iter()
		.find(|(candidate, _)| *candidate == name)
		.ok_or_else(|| {
			StorageError::Configuration(format!("Unknown storage implementation '{}'", name))
		})?;
	factory(config)
}

/// Typed JSON documents on top of a [`StorageInterface`].
pub struct StorageService {
	backend: Box<dyn StorageInterface>,
}

impl StorageService {
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	fn key(namespace: &str, id: &str) -> String {
		format!("{}:{}", namespace, id)
	}

	/// Writes `document` under `namespace:id`, overwriting any previous one.
	pub async fn store<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		document: &T,
	) -> Result<(), StorageError> {
		let bytes = serde_json::to_vec(document)
			.map_err(|e| StorageError::Serialization(e.to_string()))?;
		self.backend.set_bytes(&Self::key(namespace, id), bytes).await
	}

	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		let bytes = self.backend.get_bytes(&Self::key(namespace, id)).await?;
		serde_json::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
	}

	pub async fn remove(&self, namespace: &str, id: &str) -> Result<(), StorageError> {
		self.backend.delete(&Self::key(namespace, id)).await
	}

	/// Ids of every document stored under `namespace`.
	pub async fn list_ids(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		let prefix = format!("{}:", namespace);
		let keys = self.backend.list_keys(&prefix).await?;
		Ok(keys
			.into_iter()
			.filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use implementations::memory::MemoryStorage;

	#[tokio::test]
	async fn test_documents_by_namespace() {
		let storage = StorageService::new(Box::new(MemoryStorage::new()));

		storage.store("records", "a", &vec![1u64, 2, 3]).await.unwrap();
		storage.store("records", "b", &vec![4u64]).await.unwrap();
		storage.store("other", "c", &vec![5u64]).await.unwrap();

		let a: Vec<u64> = storage.retrieve("records", "a").await.unwrap();
		assert_eq!(a, vec![1, 2, 3]);
		assert_eq!(storage.list_ids("records").await.unwrap(), vec!["a", "b"]);

		storage.remove("records", "a").await.unwrap();
		assert!(matches!(
			storage.retrieve::<Vec<u64>>("records", "a").await,
			Err(StorageError::NotFound)
		));
	}

	#[tokio::test]
	async fn test_mistyped_document() {
		let storage = StorageService::new(Box::new(MemoryStorage::new()));
		storage.store("records", "a", &"text").await.unwrap();
		assert!(matches!(
			storage.retrieve::<Vec<u64>>("records", "a").await,
			Err(StorageError::Serialization(_))
		));
	}

	#[test]
	fn test_unknown_backend() {
		let config = toml::Value::Table(Default::default());
		assert!(matches!(
			create_backend("redis", &config),
			Err(StorageError::Configuration(_))
		));
		assert!(create_backend("memory", &config).is_ok());
	}
}

//! File-based storage backend.
//!
//! Each key `namespace:id` is stored as `<base>/<namespace>/<id>.json`.
//! Writes go to a temporary file that is renamed into place, so a crash never
//! leaves a half-written record behind.

use crate::{StorageError, StorageInterface};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Name under which this backend is selected in configuration.
pub const NAME: &str = "file";

const EXTENSION: &str = "json";
const DEFAULT_PATH: &str = "./data/storage";

pub struct FileStorage {
	root: PathBuf,
}

impl FileStorage {
	pub fn new(root: PathBuf) -> Self {
		Self { root }
	}

	fn namespace_dir(&self, namespace: &str) -> PathBuf {
		self.root.join(namespace.replace(['/', '\\', '.'], "_"))
	}

	fn document_path(&self, key: &str) -> Result<PathBuf, StorageError> {
		let (namespace, id) = key
			.split_once(':')
			.ok_or_else(|| StorageError::Backend(format!("Malformed storage key '{}'", key)))?;
		let file = format!("{}.{}", id.replace(['/', '\\', ':'], "_"), EXTENSION);
		Ok(self.namespace_dir(namespace).join(file))
	}

	async fn write_atomically(path: &Path, value: Vec<u8>) -> std::io::Result<()> {
		if let Some(dir) = path.parent() {
			fs::create_dir_all(dir).await?;
		}
		let staging = path.with_extension("tmp");
		fs::write(&staging, value).await?;
		fs::rename(&staging, path).await
	}
}

fn is_missing(err: &std::io::Error) -> bool {
	err.kind() == ErrorKind::NotFound
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		fs::read(self.document_path(key)?).await.map_err(|e| {
			if is_missing(&e) {
				StorageError::NotFound
			} else {
				StorageError::backend(e)
			}
		})
	}

	async fn set_bytes(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
		let path = self.document_path(key)?;
		Self::write_atomically(&path, value)
			.await
			.map_err(StorageError::backend)
	}

	async fn delete(&self, key: &str) -> Result<(), StorageError> {
		match fs::remove_file(self.document_path(key)?).await {
			Err(e) if !is_missing(&e) => Err(StorageError::backend(e)),
			_ => Ok(()),
		}
	}

	async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		// Prefixes are a namespace followed by ':'
		let namespace = prefix.trim_end_matches(':');
		let mut entries = match fs::read_dir(self.namespace_dir(namespace)).await {
			Ok(entries) => entries,
			Err(e) if is_missing(&e) => return Ok(Vec::new()),
			Err(e) => return Err(StorageError::backend(e)),
		};

		let mut keys = Vec::new();
		while let Some(entry) = entries.next_entry().await.map_err(StorageError::backend)? {
			let path = entry.path();
			if path.extension() != Some(OsStr::new(EXTENSION)) {
				tracing::debug!("Skipping non-record file {:?}", path);
				continue;
			}
			if let Some(id) = path.file_stem().and_then(OsStr::to_str) {
				keys.push(format!("{}:{}", namespace, id));
			}
		}
		keys.sort();
		Ok(keys)
	}
}

/// Reads the optional `storage_path` setting, defaulting to `./data/storage`.
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	let root = match config.get("storage_path") {
		None => DEFAULT_PATH,
		Some(value) => value.as_str().ok_or_else(|| {
			StorageError::Configuration("storage_path must be a string".to_string())
		})?,
	};

	Ok(Box::new(FileStorage::new(PathBuf::from(root))))
}

//! Main entry point for the oracle node chain service.
//!
//! Connects to the configured chain node, restores pending transactions from
//! storage and runs the node engine until interrupted.

use clap::Parser;
use node_account::implementations::local::LocalSigner;
use node_account::TransactionSigner;
use node_config::{Config, StorageConfig};
use node_core::{NodeEngine, PendingTxStore, TransactionManager};
use node_rpc::ProtocolClient;
use node_storage::{create_backend, StorageError, StorageService};
use std::path::PathBuf;
use std::sync::Arc;

mod pipeline;

use pipeline::LoggingPipeline;

/// Command-line arguments for the node service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started oracle node");

	let config = Config::from_file(&args.config).await?;
	tracing::info!("Loaded configuration [{}]", config.node.id);

	let engine = build_engine(config).await?;
	engine.run().await?;

	tracing::info!("Stopped oracle node");
	Ok(())
}

/// Builds the primary storage backend named in the configuration.
fn build_storage(config: &StorageConfig) -> Result<StorageService, StorageError> {
	let settings = config.implementations.get(&config.primary).ok_or_else(|| {
		StorageError::Configuration(format!(
			"No settings for storage implementation '{}'",
			config.primary
		))
	})?;
	Ok(StorageService::new(create_backend(&config.primary, settings)?))
}

/// Wires client, storage, signer and manager into an engine.
async fn build_engine(config: Config) -> Result<NodeEngine, Box<dyn std::error::Error>> {
	let client = Arc::new(ProtocolClient::connect(&config.transport).await?);
	let store = PendingTxStore::new(Arc::new(build_storage(&config.storage)?));

	let manager = Arc::new(
		TransactionManager::new(client.clone(), config.transactions.clone()).with_store(store.clone()),
	);
	let pipeline = Arc::new(LoggingPipeline);
	manager.register(pipeline.clone()).await;

	let signer: Option<Arc<dyn TransactionSigner>> = match &config.account {
		Some(account) => {
			let signer = LocalSigner::from_secret(&account.private_key)?;
			tracing::info!(address = %signer.address(), "Loaded signing account");
			Some(Arc::new(signer))
		}
		None => None,
	};

	// Records of senders without a key are still tracked, just never bumped
	for sender in store.senders().await? {
		let owned = signer
			.as_ref()
			.filter(|signer| signer.senders().contains(&sender))
			.cloned();
		let restored = manager.resume(sender, owned).await?;
		if restored > 0 {
			tracing::info!(sender = %sender, restored, "Restored pending transactions");
		}
	}

	Ok(NodeEngine::new(config, client, manager, pipeline))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	#[tokio::test]
	async fn test_build_file_storage() {
		let dir = tempfile::tempdir().unwrap();
		let mut settings = toml::map::Map::new();
		settings.insert(
			"storage_path".to_string(),
			toml::Value::String(dir.path().to_string_lossy().into_owned()),
		);
		let config = StorageConfig {
			primary: "file".to_string(),
			implementations: HashMap::from([("file".to_string(), toml::Value::Table(settings))]),
		};

		let storage = build_storage(&config).unwrap();
		storage.store("health", "one", &42u32).await.unwrap();
		assert_eq!(storage.retrieve::<u32>("health", "one").await.unwrap(), 42);
	}

	#[test]
	fn test_missing_primary_settings() {
		let config = StorageConfig {
			primary: "memory".to_string(),
			implementations: HashMap::new(),
		};
		assert!(matches!(
			build_storage(&config),
			Err(StorageError::Configuration(_))
		));
	}
}

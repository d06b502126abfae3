pub mod errors;
pub mod migrations;
pub mod store;
pub mod types;

// Re-export the store and the types that cross its API
pub use errors::StoreError;
pub use store::{RegistryStore, StoreOptions};
pub use types::*;

use std::path::PathBuf;

/// Open the store at the default path and initialize its schema
pub async fn init_store() -> anyhow::Result<RegistryStore> {
    let store = RegistryStore::open(default_store_path()).await?;
    store.setup().await?;
    Ok(store)
}

/// Get the default registry database path
pub fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".push-registry")
        .join("registry.db")
}

/// Check if a registry database exists at the default path
pub fn store_exists() -> bool {
    default_store_path().exists()
}

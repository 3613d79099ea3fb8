pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

// Export logic types
pub use logic::{
    ConstraintIndex, EntityGraphResolver, EquivalenceMerger, HierarchyClosure, ResolvedGraph,
};

// Export all model types
pub use model::*;

pub use error::{IntegrityError, ResolveError, StoreError, ValidationFailure};

// Export store types
pub use store::{MemoryStore, PostgresStore, Store};

/// Connect to the configured database and bring its schema up to date.
pub async fn open_store(config: &crate::config::AppConfig) -> anyhow::Result<PostgresStore> {
    let database_url = config.database_url()?;
    let store = PostgresStore::new(&database_url, config.max_connections()).await?;
    store.migrate().await?;
    Ok(store)
}

use log::{info, warn};
use quantdb::config::AppConfig;
use quantdb::logic::HierarchyClosure;
use quantdb::model::{EntityKind, Hierarchy};
use quantdb::store::EntityStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    info!(
        "Configuration loaded: max_connections={}, conflict_retries={}",
        config.max_connections(),
        config.resolver.conflict_retries
    );

    info!("Connecting to PostgreSQL and running migrations...");
    let store = Arc::new(quantdb::open_store(&config).await?);

    for kind in EntityKind::ALL {
        let count = store.count(kind).await?;
        println!("{:<20} {:>10}", kind.table(), count);
    }

    let mut corrupt = 0;
    for hierarchy in Hierarchy::ALL {
        let closure = HierarchyClosure::new(store.clone(), hierarchy);
        match closure.verify().await {
            Ok(()) => info!("{} is acyclic", hierarchy),
            Err(err) => {
                warn!("{}", err);
                corrupt += 1;
            }
        }
    }

    if corrupt > 0 {
        anyhow::bail!("{} hierarchies failed the integrity check", corrupt);
    }

    Ok(())
}

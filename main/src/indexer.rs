//! Standalone indexing loop: restart this binary after an embedding quota
//! refill without touching the harvest stages.

use std::sync::Arc;

use common::{storage::db::SurrealDbClient, utils::config::get_config};
use index_pipeline::{
    embedding::embedder_from_config, ledger::RenameLedger, run_indexer_loop,
    vector::SurrealVectorStore, Indexer,
};
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    let embedder = embedder_from_config(&config)?;
    let store = Arc::new(SurrealVectorStore::new(db));
    let indexer = Arc::new(Indexer::new(
        Arc::new(RenameLedger::default()),
        embedder,
        store,
        &config,
    ));

    info!("indexer starting");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
        result = run_indexer_loop(
            indexer,
            Duration::from_secs(config.index_poll_secs),
            Duration::from_secs(config.index_max_backoff_secs),
        ) => {
            if let Err(err) = &result {
                error!(error = %err, "indexing loop stopped");
            }
            result.map_err(Into::into)
        }
    }
}

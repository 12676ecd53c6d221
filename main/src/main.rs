use std::sync::Arc;

use common::{
    manifest::store::FsManifestStore,
    storage::db::SurrealDbClient,
    utils::config::{get_config, AppConfig},
};
use harvest_pipeline::{
    acquirer::Acquirer,
    assemble::{Assembler, PdfTextExtractor},
    handoff::HandoffTrigger,
    relocate::Relocator,
    renderer::chrome::ChromeRenderer,
    throttle::MarkerPhraseClassifier,
};
use index_pipeline::{
    embedding::embedder_from_config, ledger::RenameLedger, run_indexer_loop,
    vector::SurrealVectorStore, Indexer,
};
use tokio::{sync::watch, time::Duration};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;
    ensure_directories(&config).await?;

    // Shared coordination: manifest stores over the shared directories and a
    // watch flag the draining actors consume.
    let acquire_manifests = Arc::new(FsManifestStore::new(&config.acquire_dir));
    let handoff_manifests = Arc::new(FsManifestStore::new(&config.handoff_dir));
    let (acquirer_done_tx, acquirer_done_rx) = watch::channel(false);

    // Acquirer
    let renderer = Arc::new(ChromeRenderer::new(&config)?);
    let acquirer = Acquirer::new(
        renderer,
        acquire_manifests.clone(),
        Arc::new(MarkerPhraseClassifier::default()),
        &config,
    )?;
    let acquirer_handle = tokio::spawn(async move {
        if let Err(err) = acquirer.run().await {
            error!(error = %err, "acquirer stopped with an error");
        }
        // Either way the filter space is exhausted; let the others drain.
        let _ = acquirer_done_tx.send(true);
    });

    // Relocator
    let relocator = Relocator::new(acquire_manifests, handoff_manifests.clone(), &config);
    let relocator_done = acquirer_done_rx.clone();
    let relocator_handle = tokio::spawn(async move { relocator.run(relocator_done).await });

    // Handoff trigger + assembler
    let assembler = Assembler::new(
        &config.handoff_dir,
        &config.merged_dir,
        Arc::new(PdfTextExtractor),
        &config.partial_suffix,
    );
    let trigger = HandoffTrigger::new(handoff_manifests, assembler, &config);
    let trigger_done = acquirer_done_rx.clone();
    let trigger_handle = tokio::spawn(async move { trigger.run(trigger_done).await });

    // Indexer
    let indexer = build_indexer(&config).await?;
    let base_poll = Duration::from_secs(config.index_poll_secs);
    let max_backoff = Duration::from_secs(config.index_max_backoff_secs);
    let mut indexer_handle =
        tokio::spawn(async move { run_indexer_loop(indexer, base_poll, max_backoff).await });

    info!("pipeline started: acquirer, relocator, handoff trigger, indexer");

    acquirer_handle.await?;
    relocator_handle.await??;
    trigger_handle.await??;
    info!("harvest stages drained; indexing continues (Ctrl-C to stop)");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
        result = &mut indexer_handle => {
            if let Err(err) = result? {
                error!(error = %err, "indexing loop stopped");
            }
        }
    }

    Ok(())
}

async fn ensure_directories(config: &AppConfig) -> std::io::Result<()> {
    for dir in [
        &config.work_dir,
        &config.acquire_dir,
        &config.handoff_dir,
        &config.merged_dir,
    ] {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(())
}

async fn build_indexer(config: &AppConfig) -> Result<Arc<Indexer>, Box<dyn std::error::Error>> {
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
    let embedder = embedder_from_config(config)?;
    let store = Arc::new(SurrealVectorStore::new(db));

    Ok(Arc::new(Indexer::new(
        Arc::new(RenameLedger::default()),
        embedder,
        store,
        config,
    )))
}

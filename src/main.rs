use clap::Parser;
use stark_indexer::config::Config;
use stark_indexer::indexer::Indexer;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let config = Config::parse();

    log::info!("🚀 Starting Starknet Indexer 🚀");
    let indexer = Indexer::open(&config)?;
    log::info!("💾 Database opened at {}", config.db);

    let ct = CancellationToken::new();
    tokio::spawn({
        let ct = ct.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Stopping after the current block...");
                ct.cancel();
            }
        }
    });

    match indexer
        .sync(config.start_block, config.end_block, &ct)
        .await
    {
        Ok(Some(last)) => log::info!("🚀 Synced up to block {last}"),
        Ok(None) => log::info!("Nothing synced"),
        Err(e) => log::error!("❌ Sync error: {e}"),
    }

    indexer.flush()?;
    log::info!("Exiting");
    Ok(())
}

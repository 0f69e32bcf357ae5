use clap::Parser;

use cachenode::{cache::ContentStore, cli::Cli, config::Config, logging, supervisor};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_tracing();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if cli.shrink_database {
        let limit_bytes = config.cache.max_size_mebibytes * 1024 * 1024;
        let store = match ContentStore::open(
            config.cache.directory.clone().into(),
            limit_bytes,
            config.cache.refresh_age_seconds as i64,
        ) {
            Ok(store) => store,
            Err(e) => {
                tracing::error!(error = %e, "failed to open cache directory for compaction");
                std::process::exit(1);
            }
        };

        if let Err(e) = store.compact() {
            tracing::error!(error = %e, "database compaction failed");
            std::process::exit(1);
        }

        tracing::info!("database compaction complete");
        return;
    }

    if let Err(e) = supervisor::run(config).await {
        tracing::error!(error = %e, "node exited with a fatal error");
        std::process::exit(1);
    }
}

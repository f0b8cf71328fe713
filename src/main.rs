//! Segstore: main entry point

use anyhow::Result;
use clap::Parser;
use segstore::api::EventStore;
use segstore::cli::{Cli, Commands};
use segstore::config::StorageConfig;
use segstore::storage::chain_segments_descending;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = StorageConfig::new(&cli.storage_root, &cli.context);

    match cli.command {
        Commands::Stats => {
            let store = EventStore::open(config)?;
            let engine = store.events_engine();
            let segments = chain_segments_descending(&*engine.head_layer());
            let stats = serde_json::json!({
                "context": cli.context,
                "first_token": engine.first_token(),
                "last_token": engine.last_token(),
                "next_token": engine.next_token(),
                "segments": segments.len(),
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
            store.close();
        }
        Commands::Validate { segments } => {
            if let Some(segments) = segments {
                config = config.with_validation_segments(segments);
            }
            // Opening the store runs validation and rebuilds stale indices
            let store = EventStore::open(config)?;
            println!("validation passed");
            store.close();
        }
        Commands::TokenAt { instant } => {
            let store = EventStore::open(config)?;
            println!("{}", store.get_token_at(instant)?);
            store.close();
        }
    }
    Ok(())
}

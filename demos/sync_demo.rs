//! Wires a client context, the in-process channel, the authoritative
//! service and a memory store together and walks through a session.
//!
//! Run with `cargo run --example sync_demo`; set `RUST_LOG=veil_sync=debug`
//! for the full trace.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use veil_sync::service::start_auto_prune;
use veil_sync::{
    init_tracing, ItemState, LocalTransport, MemoryStore, Readiness, StateService, SyncClient,
    SyncConfig, WriteBatcher,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("veil_sync=info");

    let config = SyncConfig::from_env()?;

    let store = Arc::new(MemoryStore::new());
    let batcher = WriteBatcher::new(store.clone(), config.batch.clone());
    let service = StateService::new(store.clone(), batcher, config.max_stored_records);
    let pruner = tokio::spawn(start_auto_prune(service.clone(), Duration::from_secs(60)));

    let client = SyncClient::new(&config, Arc::new(LocalTransport::new(service.clone())))?;

    if let Readiness::Degraded(reason) = client.health_check().await {
        println!("Running with reduced functionality: {}", reason);
    }

    client.set_state("video-1", ItemState::Hidden, "Unboxing").await?;
    client.set_state("video-2", ItemState::Dimmed, "Trailer").await?;
    client.set_state("video-3", ItemState::Hidden, "Review").await?;
    client.set_state("video-3", ItemState::Normal, "Review").await?;

    // A second context starts cold and fetches through the channel
    let other = SyncClient::new(&config, Arc::new(LocalTransport::new(service.clone())))?;
    let ids: Vec<String> = (1..=4).map(|i| format!("video-{}", i)).collect();
    let mut results: Vec<_> = other.fetch_many(&ids).await.into_iter().collect();
    results.sort_by(|a, b| a.0.cmp(&b.0));
    for (id, record) in results {
        match record {
            Some(record) => println!("{}: {} ({})", id, record.state, record.title),
            None => println!("{}: normal", id),
        }
    }

    service.batcher().shutdown().await?;
    let stats = service.stats().await?;
    println!(
        "Store: {} records ({} hidden, {} dimmed)",
        stats.total, stats.hidden, stats.dimmed
    );
    println!("Client cache: {}", other.cache().stats().await);

    pruner.abort();
    Ok(())
}

//! Replay a recorded push stream through the sync consumer.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use contract_sync_app::{SyncConfig, SyncEngine};
use contract_sync_cache::CacheStats;
use contract_sync_core::{ChangeEvent, ConflictRecord, Fields, PendingMutation};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

/// Final state after a replay.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub processed: usize,
    pub entities: BTreeMap<String, Fields>,
    pub open_conflicts: Vec<ConflictRecord>,
    pub pending_mutations: Vec<PendingMutation>,
    pub stats: CacheStats,
}

/// Read one [`ChangeEvent`] per non-blank line.
pub fn read_events(path: &Path) -> Result<Vec<ChangeEvent>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("invalid event on line {} of {}", index + 1, path.display()))
        })
        .collect()
}

/// Read a JSON array of [`PendingMutation`]s.
pub fn read_mutations(path: &Path) -> Result<Vec<PendingMutation>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("invalid mutations in {}", path.display()))
}

/// Register `mutations`, then feed `events` through the consumer in order.
pub async fn replay(
    config: SyncConfig,
    events: Vec<ChangeEvent>,
    mutations: Vec<PendingMutation>,
) -> Result<ReplayReport> {
    let engine = SyncEngine::new(config);
    let consumer = engine.consumer();

    let tracked: Vec<_> = mutations.iter().map(|m| m.entity_id.clone()).collect();
    for mutation in mutations {
        consumer.register_mutation(mutation);
    }

    let (tx, rx) = mpsc::channel(events.len().max(1));
    let task = consumer.spawn(rx);
    for event in events {
        tx.send(event).await.context("consumer stopped early")?;
    }
    drop(tx);
    let processed = task.await.context("consumer task failed")?;
    info!(processed, "replay finished");

    let entities = engine
        .cache()
        .export_snapshot(engine.config().cache.default_ttl())
        .entries
        .into_iter()
        .map(|entry| (entry.key, entry.value))
        .collect();
    let pending_mutations = tracked
        .iter()
        .filter_map(|id| consumer.pending_mutation(id))
        .collect();

    Ok(ReplayReport {
        processed,
        entities,
        open_conflicts: consumer.open_conflicts(),
        pending_mutations,
        stats: engine.cache().stats(),
    })
}

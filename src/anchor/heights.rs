//! Cached watermarks with periodic flush
//!
//! Reads and raises go to memory; dirty entries are written to the
//! [`WatermarkStore`] by [`WatermarkCache::flush`]. Each watermark is
//! monotonic on its own, so a flush can write them independently.

use eyre::{Result, WrapErr};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::db::WatermarkStore;
use crate::metrics;
use crate::models::{AnchorProcessHeights, WatermarkName};
use crate::types::ChainKey;

struct Entry {
    heights: AnchorProcessHeights,
    dirty: BTreeSet<WatermarkName>,
}

pub struct WatermarkCache {
    store: Arc<dyn WatermarkStore>,
    entries: Mutex<HashMap<ChainKey, Entry>>,
}

impl WatermarkCache {
    pub fn new(store: Arc<dyn WatermarkStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn with_entry<T>(&self, chain: &ChainKey, f: impl FnOnce(&mut Entry) -> T) -> Result<T> {
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(chain) {
            let heights = self
                .store
                .load(chain)
                .await
                .wrap_err_with(|| format!("Failed to load watermarks of {}", chain))?;
            entries.insert(
                chain.clone(),
                Entry {
                    heights,
                    dirty: BTreeSet::new(),
                },
            );
        }
        // Inserted above when missing
        let entry = entries
            .get_mut(chain)
            .ok_or_else(|| eyre::eyre!("watermarks of {} missing from cache", chain))?;
        Ok(f(entry))
    }

    /// Snapshot of every watermark of `chain`
    pub async fn heights(&self, chain: &ChainKey) -> Result<AnchorProcessHeights> {
        self.with_entry(chain, |e| e.heights.clone()).await
    }

    pub async fn get(&self, chain: &ChainKey, name: WatermarkName) -> Result<u64> {
        self.with_entry(chain, |e| e.heights.get(name)).await
    }

    /// Raise a watermark in memory. Lower values are ignored.
    pub async fn raise(&self, chain: &ChainKey, name: WatermarkName, height: u64) -> Result<()> {
        let changed = self
            .with_entry(chain, |e| {
                let before = e.heights.get(name);
                if e.heights.raise(name, height) && height != before {
                    e.dirty.insert(name);
                    true
                } else {
                    false
                }
            })
            .await?;
        if changed {
            metrics::set_watermark(chain, &name.as_key(), height);
        }
        Ok(())
    }

    /// Write every dirty watermark to the store
    pub async fn flush(&self) -> Result<()> {
        let pending: Vec<(ChainKey, WatermarkName, u64)> = {
            let mut entries = self.entries.lock().await;
            entries
                .iter_mut()
                .flat_map(|(chain, entry)| {
                    let dirty = std::mem::take(&mut entry.dirty);
                    let heights = &entry.heights;
                    dirty
                        .into_iter()
                        .map(move |name| (chain.clone(), name, heights.get(name)))
                })
                .collect()
        };

        let mut first_error = None;
        for (chain, name, height) in pending {
            if let Err(e) = self.store.save(&chain, name, height).await {
                error!(chain = %chain, watermark = %name, height, error = %e, "Failed to flush watermark");
                // Retry on the next flush
                if let Some(entry) = self.entries.lock().await.get_mut(&chain) {
                    entry.dirty.insert(name);
                }
                first_error.get_or_insert(e);
            } else {
                debug!(chain = %chain, watermark = %name, height, "Watermark flushed");
            }
        }

        match first_error {
            Some(e) => Err(e).wrap_err("Watermark flush incomplete"),
            None => Ok(()),
        }
    }

    /// Flush every `interval` until shutdown, then flush once more
    pub fn spawn_flush_loop(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush().await {
                            error!(error = %e, "Periodic watermark flush failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Watermark flush loop stopping");
                        break;
                    }
                }
            }
            if let Err(e) = self.flush().await {
                error!(error = %e, "Final watermark flush failed");
            }
        })
    }
}

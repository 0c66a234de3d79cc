use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Mutex;
use std::time::Duration;

use hyperloglogplus::{HyperLogLog, HyperLogLogPlus};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::Result;

/// Precision 14 gives a dense sketch of ~12 KB and roughly 0.8% standard
/// error.
const SKETCH_PRECISION: u8 = 14;

/// Deterministic hasher so persisted sketches keep counting correctly after
/// a restart.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SketchHasher;

impl BuildHasher for SketchHasher {
    type Hasher = DefaultHasher;

    fn build_hasher(&self) -> DefaultHasher {
        DefaultHasher::new()
    }
}

type Sketch = HyperLogLogPlus<String, SketchHasher>;

struct SketchEntry {
    sketch: Sketch,
    dirty: bool,
    count: i64,
}

struct FlushItem {
    owner_id: Uuid,
    name: String,
    blob: Vec<u8>,
    estimate: i64,
    count: i64,
}

/// In-memory HyperLogLog sketches per `(operator key, metadata name)`,
/// periodically persisted. Values themselves are never stored, only the
/// sketch and its cardinality estimate.
pub struct HllEngine {
    pool: PgPool,
    sketches: Mutex<HashMap<(Uuid, String), SketchEntry>>,
    shutdown: tokio::sync::watch::Sender<bool>,
    flusher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HllEngine {
    pub fn new(pool: PgPool, flush_interval: Duration) -> std::sync::Arc<Self> {
        let (shutdown, mut shutdown_rx) = tokio::sync::watch::channel(false);
        let engine = std::sync::Arc::new(Self {
            pool,
            sketches: Mutex::new(HashMap::new()),
            shutdown,
            flusher: Mutex::new(None),
        });

        let flush_target = std::sync::Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        flush_target.flush().await;
                    }
                    _ = shutdown_rx.changed() => {
                        flush_target.flush().await;
                        return;
                    }
                }
            }
        });
        *engine.flusher.lock().expect("flusher lock poisoned") = Some(handle);

        engine
    }

    /// Reads every persisted sketch back into memory. Rows that fail to
    /// deserialize are skipped with a warning and treated as new.
    pub async fn load_from_store(&self) -> Result<usize> {
        let rows = sqlx::query_as::<_, (Uuid, String, Vec<u8>)>(
            "SELECT majordomo_api_key_id, key_name, hll_state
             FROM llm_requests_metadata_keys
             WHERE hll_state IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut loaded = 0;
        let mut sketches = self.sketches.lock().expect("hll lock poisoned");
        for (owner_id, name, blob) in rows {
            match serde_json::from_slice::<Sketch>(&blob) {
                Ok(sketch) => {
                    sketches.insert(
                        (owner_id, name),
                        SketchEntry {
                            sketch,
                            dirty: false,
                            count: 0,
                        },
                    );
                    loaded += 1;
                }
                Err(err) => {
                    tracing::warn!(api_key_id = %owner_id, key = %name, error = %err,
                        "failed to deserialize HLL sketch");
                }
            }
        }
        Ok(loaded)
    }

    /// Inserts a value into the sketch for `(owner, name)`, creating the
    /// sketch on demand.
    pub fn add(&self, owner_id: Uuid, name: &str, value: &str) {
        let mut sketches = self.sketches.lock().expect("hll lock poisoned");
        let entry = match sketches.entry((owner_id, name.to_string())) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                let sketch = match HyperLogLogPlus::new(SKETCH_PRECISION, SketchHasher) {
                    Ok(sketch) => sketch,
                    Err(err) => {
                        tracing::warn!(key = %name, error = ?err, "failed to create HLL sketch");
                        return;
                    }
                };
                slot.insert(SketchEntry {
                    sketch,
                    dirty: false,
                    count: 0,
                })
            }
        };
        entry.sketch.insert(&value.to_string());
        entry.dirty = true;
        entry.count += 1;
    }

    /// Persists every dirty sketch. Concurrent adds after the snapshot
    /// re-dirty the entry and land in the next flush.
    pub async fn flush(&self) {
        let items = self.snapshot_dirty();
        if items.is_empty() {
            return;
        }
        let flushed = items.len();
        for item in items {
            self.persist(item).await;
        }
        tracing::debug!(count = flushed, "flushed HLL sketches");
    }

    /// Signals the flush loop to stop and waits for its final flush.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.flusher.lock().expect("flusher lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "HLL flusher exited abnormally");
            }
        }
    }

    fn snapshot_dirty(&self) -> Vec<FlushItem> {
        let mut sketches = self.sketches.lock().expect("hll lock poisoned");
        let mut items = Vec::new();
        for ((owner_id, name), entry) in sketches.iter_mut() {
            if !entry.dirty {
                continue;
            }
            let count = entry.count;
            entry.dirty = false;
            entry.count = 0;

            // Estimate before serializing so the persisted blob carries any
            // internal normalization done by counting.
            let estimate = entry.sketch.count().round() as i64;
            match serde_json::to_vec(&entry.sketch) {
                Ok(blob) => items.push(FlushItem {
                    owner_id: *owner_id,
                    name: name.clone(),
                    blob,
                    estimate,
                    count,
                }),
                Err(err) => {
                    tracing::warn!(key = %name, error = %err, "failed to serialize HLL sketch");
                }
            }
        }
        items
    }

    async fn persist(&self, item: FlushItem) {
        let result = sqlx::query(
            r#"
            INSERT INTO llm_requests_metadata_keys (
                majordomo_api_key_id, key_name, hll_state, approx_cardinality,
                request_count, last_seen_at, hll_updated_at
            ) VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
            ON CONFLICT (majordomo_api_key_id, key_name) DO UPDATE SET
                hll_state = EXCLUDED.hll_state,
                approx_cardinality = EXCLUDED.approx_cardinality,
                request_count = llm_requests_metadata_keys.request_count + EXCLUDED.request_count,
                last_seen_at = NOW(),
                hll_updated_at = NOW()
            "#,
        )
        .bind(item.owner_id)
        .bind(&item.name)
        .bind(&item.blob)
        .bind(item.estimate)
        .bind(item.count)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            tracing::warn!(api_key_id = %item.owner_id, key = %item.name, error = %err,
                "failed to flush HLL sketch");
        }
    }
}

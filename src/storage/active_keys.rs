use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use uuid::Uuid;

/// Per-tenant set of metadata names flagged for indexing, cached with a TTL
/// so the log writer doesn't hit the store on every row. Lookup errors
/// degrade into "nothing indexed" rather than failing the write.
pub struct ActiveKeysCache {
    pool: PgPool,
    cache: RwLock<HashMap<Uuid, CachedSet>>,
    ttl: Duration,
}

struct CachedSet {
    names: HashSet<String>,
    expires_at: Instant,
}

impl ActiveKeysCache {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get_active(&self, owner_id: Uuid) -> HashSet<String> {
        {
            let cache = self.cache.read().expect("active keys lock poisoned");
            if let Some(entry) = cache.get(&owner_id) {
                if Instant::now() < entry.expires_at {
                    return entry.names.clone();
                }
            }
        }

        let names = self.fetch_active(owner_id).await;

        let mut cache = self.cache.write().expect("active keys lock poisoned");
        cache.insert(
            owner_id,
            CachedSet {
                names: names.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        names
    }

    async fn fetch_active(&self, owner_id: Uuid) -> HashSet<String> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT key_name FROM llm_requests_metadata_keys
             WHERE majordomo_api_key_id = $1 AND is_active = true",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(names) => names.into_iter().collect(),
            Err(err) => {
                tracing::warn!(api_key_id = %owner_id, error = %err, "failed to fetch active keys");
                HashSet::new()
            }
        }
    }

    /// Drops the cached set for one tenant. Call after a descriptor
    /// activation so the next write re-reads the store.
    pub fn invalidate(&self, owner_id: Uuid) {
        self.cache
            .write()
            .expect("active keys lock poisoned")
            .remove(&owner_id);
    }

    pub fn invalidate_all(&self) {
        self.cache
            .write()
            .expect("active keys lock poisoned")
            .clear();
    }
}

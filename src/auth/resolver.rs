use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::auth::hash_key;
use crate::error::CredentialError;
use crate::models::ApiKeyInfo;
use crate::storage::ApiKeyStore;
use crate::Result;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
enum Verdict {
    Valid(ApiKeyInfo),
    Invalid(CredentialError),
}

struct CachedVerdict {
    verdict: Verdict,
    expires_at: Instant,
}

/// Resolves presented operator keys against the store, with a TTL cache that
/// remembers both valid and invalid verdicts.
pub struct Resolver {
    store: Arc<dyn ApiKeyStore>,
    cache: RwLock<HashMap<String, CachedVerdict>>,
    ttl: Duration,
}

impl Resolver {
    pub fn new(store: Arc<dyn ApiKeyStore>) -> Self {
        Self::with_ttl(store, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn ApiKeyStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Validates a presented operator key. A successful resolve bumps the
    /// record's usage counters off the request path.
    pub async fn resolve(&self, presented: &str) -> Result<ApiKeyInfo> {
        if presented.is_empty() {
            return Err(CredentialError::InvalidKey.into());
        }

        let digest = hash_key(presented);

        if let Some(verdict) = self.cached(&digest) {
            return match verdict {
                Verdict::Valid(info) => Ok(info),
                Verdict::Invalid(kind) => Err(kind.into()),
            };
        }

        let Some(key) = self.store.api_key_by_hash(&digest).await? else {
            self.cache_verdict(&digest, Verdict::Invalid(CredentialError::InvalidKey));
            return Err(CredentialError::InvalidKey.into());
        };

        if !key.is_active {
            let kind = if key.revoked_at.is_some() {
                CredentialError::Revoked
            } else {
                CredentialError::Inactive
            };
            self.cache_verdict(&digest, Verdict::Invalid(kind));
            return Err(kind.into());
        }

        let info = ApiKeyInfo {
            id: key.id,
            digest: digest.clone(),
            name: key.name.clone(),
        };
        self.cache_verdict(&digest, Verdict::Valid(info.clone()));

        let store = Arc::clone(&self.store);
        let key_id = key.id;
        tokio::spawn(async move {
            if let Err(err) = store.bump_api_key_usage(key_id).await {
                tracing::warn!(key_id = %key_id, error = %err, "failed to bump operator key usage");
            }
        });

        Ok(info)
    }

    /// Drops the cached verdict for a key digest. Call after revocation so
    /// the next resolve re-reads the store.
    pub fn invalidate(&self, digest: &str) {
        self.cache
            .write()
            .expect("resolver cache lock poisoned")
            .remove(digest);
    }

    fn cached(&self, digest: &str) -> Option<Verdict> {
        let cache = self.cache.read().expect("resolver cache lock poisoned");
        let entry = cache.get(digest)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        Some(entry.verdict.clone())
    }

    fn cache_verdict(&self, digest: &str, verdict: Verdict) {
        let mut cache = self.cache.write().expect("resolver cache lock poisoned");
        cache.insert(
            digest.to_string(),
            CachedVerdict {
                verdict,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

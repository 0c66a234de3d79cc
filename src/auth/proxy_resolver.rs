use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::auth::{hash_key, PROXY_KEY_PREFIX};
use crate::error::CredentialError;
use crate::providers::Provider;
use crate::secrets::SecretBox;
use crate::storage::ProxyKeyStore;
use crate::Result;

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Outcome of resolving the caller's upstream `Authorization` value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyResolution {
    /// The caller presented its own upstream credential; forward unchanged.
    Passthrough,
    /// The caller presented a proxy key; forward the decrypted upstream
    /// credential instead.
    Substituted {
        credential: String,
        proxy_key_id: Uuid,
    },
}

#[derive(Clone)]
struct CachedProxyKey {
    proxy_key_id: Uuid,
    expires_at: Instant,
}

/// Validates proxy keys and resolves them to decrypted upstream credentials.
/// Keeps a per-digest record cache and a per-`(digest, provider)` decrypted
/// credential cache.
pub struct ProxyResolver {
    store: Arc<dyn ProxyKeyStore>,
    secret_box: SecretBox,
    records: RwLock<HashMap<String, CachedProxyKey>>,
    credentials: RwLock<HashMap<(String, String), String>>,
    ttl: Duration,
}

impl ProxyResolver {
    pub fn new(store: Arc<dyn ProxyKeyStore>, secret_box: SecretBox) -> Self {
        Self::with_ttl(store, secret_box, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn ProxyKeyStore>, secret_box: SecretBox, ttl: Duration) -> Self {
        Self {
            store,
            secret_box,
            records: RwLock::new(HashMap::new()),
            credentials: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Resolves the presented upstream auth token for `provider`, on behalf
    /// of the operator key `owner_id`. Non-proxy tokens pass through.
    pub async fn resolve(
        &self,
        presented: &str,
        provider: Provider,
        owner_id: Uuid,
    ) -> Result<ProxyResolution> {
        if !presented.starts_with(PROXY_KEY_PREFIX) {
            return Ok(ProxyResolution::Passthrough);
        }

        let digest = hash_key(presented);
        let provider_tag = provider.as_str();

        if let Some(hit) = self.cached_credential(&digest, provider_tag) {
            return Ok(ProxyResolution::Substituted {
                credential: hit.0,
                proxy_key_id: hit.1,
            });
        }

        let Some(proxy_key) = self.store.proxy_key_by_hash(&digest).await? else {
            return Err(CredentialError::ProxyNotFound.into());
        };

        if !proxy_key.is_active {
            if proxy_key.revoked_at.is_some() {
                return Err(CredentialError::ProxyRevoked.into());
            }
            return Err(CredentialError::ProxyInactive.into());
        }

        if proxy_key.majordomo_api_key_id != owner_id {
            return Err(CredentialError::WrongOwner.into());
        }

        let Some(mapping) = self
            .store
            .provider_mapping(proxy_key.id, provider_tag)
            .await?
        else {
            return Err(CredentialError::NoProviderMapping.into());
        };

        let credential = self
            .secret_box
            .decrypt(&mapping.encrypted_key)
            .map_err(|err| {
                tracing::warn!(proxy_key_id = %proxy_key.id, provider = provider_tag, error = %err,
                    "failed to decrypt provider credential");
                CredentialError::CipherFail
            })?;

        {
            let mut records = self.records.write().expect("proxy record lock poisoned");
            records.insert(
                digest.clone(),
                CachedProxyKey {
                    proxy_key_id: proxy_key.id,
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
        {
            let mut credentials = self.credentials.write().expect("credential lock poisoned");
            credentials.insert((digest, provider_tag.to_string()), credential.clone());
        }

        let store = Arc::clone(&self.store);
        let proxy_key_id = proxy_key.id;
        tokio::spawn(async move {
            if let Err(err) = store.bump_proxy_key_usage(proxy_key_id).await {
                tracing::warn!(proxy_key_id = %proxy_key_id, error = %err,
                    "failed to bump proxy key usage");
            }
        });

        Ok(ProxyResolution::Substituted {
            credential,
            proxy_key_id: proxy_key.id,
        })
    }

    /// Wipes the record entry and every derived credential entry for a key
    /// digest. Call after revocation or a mapping change.
    pub fn invalidate(&self, digest: &str) {
        self.records
            .write()
            .expect("proxy record lock poisoned")
            .remove(digest);
        self.credentials
            .write()
            .expect("credential lock poisoned")
            .retain(|(cached_digest, _), _| cached_digest != digest);
    }

    fn cached_credential(&self, digest: &str, provider_tag: &str) -> Option<(String, Uuid)> {
        let credentials = self.credentials.read().expect("credential lock poisoned");
        let credential = credentials.get(&(digest.to_string(), provider_tag.to_string()))?;

        // The credential entry is only valid while the record entry is fresh.
        let records = self.records.read().expect("proxy record lock poisoned");
        let record = records.get(digest)?;
        if Instant::now() >= record.expires_at {
            return None;
        }
        Some((credential.clone(), record.proxy_key_id))
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::config;

/// Cached access token minted by the user API.
#[derive(Debug, Clone, Default)]
pub struct TokenCache {
    token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl TokenCache {
    /// Returns the cached token unless it is within the renewal skew of
    /// expiry.
    pub fn valid_token(&self, now: DateTime<Utc>, skew: chrono::Duration) -> Option<String> {
        match (&self.token, self.expires_at) {
            (Some(token), Some(expires_at)) if expires_at - skew > now => Some(token.clone()),
            _ => None,
        }
    }

    pub fn store(&mut self, token: String, expires_at: DateTime<Utc>) {
        self.token = Some(token);
        self.expires_at = Some(expires_at);
    }

    pub fn clear(&mut self) {
        self.token = None;
        self.expires_at = None;
    }
}

struct Inner {
    /// Per-identifier mutexes serializing driver operations on the same
    /// resource; entries are freed once no operation holds them.
    id_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    token: Mutex<TokenCache>,
}

/// Shared agent state: configuration, HTTP client, the token cache, and the
/// per-identifier mutex table. No other local state survives a restart.
#[derive(Clone)]
pub struct SharedState {
    pub cfg: config::AppConfig,
    pub node_id: Uuid,
    pub client: reqwest::Client,
    inner: Arc<Inner>,
}

impl SharedState {
    pub fn new(cfg: config::AppConfig, node_id: Uuid, client: reqwest::Client) -> Self {
        Self {
            cfg,
            node_id,
            client,
            inner: Arc::new(Inner {
                id_locks: Mutex::new(HashMap::new()),
                token: Mutex::new(TokenCache::default()),
            }),
        }
    }

    /// Serialize operations on one identifier. The returned guard owns the
    /// entry; when the last clone is dropped the table entry is collected on
    /// the next acquisition sweep.
    pub async fn lock_identifier(&self, uuid: Uuid) -> IdentifierGuard {
        let lock = {
            let mut table = self.inner.id_locks.lock().await;
            table.retain(|_, entry| Arc::strong_count(entry) > 1);
            table.entry(uuid).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        IdentifierGuard::acquire(lock).await
    }

    pub async fn token_cache(&self) -> MutexGuard<'_, TokenCache> {
        self.inner.token.lock().await
    }
}

/// Holds one identifier's mutex for the duration of a driver operation.
pub struct IdentifierGuard {
    _lock: Arc<Mutex<()>>,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl IdentifierGuard {
    async fn acquire(lock: Arc<Mutex<()>>) -> Self {
        let guard = lock.clone().lock_owned().await;
        Self {
            _lock: lock,
            _guard: guard,
        }
    }
}

/// Poll period with bounded jitter so a fleet of agents does not align its
/// fetches.
pub fn jittered_poll_period(cfg: &config::UniversalAgentConfig) -> Duration {
    let base = Duration::from_secs(cfg.poll_period_secs.max(1));
    if cfg.poll_jitter_ms == 0 {
        return base;
    }
    let jitter = rand::rng().random_range(0..=cfg.poll_jitter_ms);
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::base_config;

    #[test]
    fn token_cache_honors_renewal_skew() {
        let mut cache = TokenCache::default();
        let now = Utc::now();
        assert!(cache.valid_token(now, chrono::Duration::seconds(60)).is_none());

        cache.store("tok".into(), now + chrono::Duration::seconds(120));
        assert_eq!(
            cache.valid_token(now, chrono::Duration::seconds(60)).as_deref(),
            Some("tok")
        );
        // Within the skew window the token is treated as expired.
        assert!(cache
            .valid_token(now + chrono::Duration::seconds(90), chrono::Duration::seconds(60))
            .is_none());
    }

    #[tokio::test]
    async fn identifier_locks_serialize_and_free() {
        let cfg = base_config();
        let node_id = Uuid::new_v4();
        let state = SharedState::new(cfg, node_id, reqwest::Client::new());
        let uuid = Uuid::new_v4();

        let guard = state.lock_identifier(uuid).await;
        {
            let table = state.inner.id_locks.lock().await;
            assert!(table.contains_key(&uuid));
        }
        drop(guard);

        // The next acquisition sweep collects the free entry.
        let _other = state.lock_identifier(Uuid::new_v4()).await;
        let table = state.inner.id_locks.lock().await;
        assert!(!table.contains_key(&uuid));
    }

    #[test]
    fn jittered_poll_period_stays_bounded() {
        let cfg = base_config();
        let period = jittered_poll_period(&cfg.universal_agent);
        let base = Duration::from_secs(cfg.universal_agent.poll_period_secs);
        assert!(period >= base);
        assert!(period <= base + Duration::from_millis(cfg.universal_agent.poll_jitter_ms));
    }
}

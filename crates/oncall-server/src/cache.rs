use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use oncall_contracts::{OnCallResult, ResolveError};
use oncall_kernel::{expires_at, is_expired, store_key, union_identities};
use tracing::{debug, warn};

use crate::store::KvStore;

type Refresh = Shared<BoxFuture<'static, Result<OnCallResult, ResolveError>>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: OnCallResult,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    inflight: Option<Refresh>,
}

/// Per-mention TTL cache. Concurrent lookups of an expired or missing key
/// share one refresh; a failed refresh falls back to the expired value.
pub struct OnCallCache {
    slots: DashMap<String, Slot>,
    store: Option<Arc<dyn KvStore>>,
    retention_secs: i64,
    // Unix millis of the last clear; persisted values fetched earlier are
    // only good for stale-serve.
    cleared_at_ms: AtomicI64,
}

impl OnCallCache {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            store: None,
            retention_secs: 0,
            cleared_at_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Writes every successful refresh through to `store` and hydrates cold
    /// keys from it.
    pub fn with_store(mut self, store: Arc<dyn KvStore>, retention_secs: i64) -> Self {
        self.store = Some(store);
        self.retention_secs = retention_secs;
        self
    }

    pub async fn get<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        refresh: F,
    ) -> Result<OnCallResult, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<OnCallResult, ResolveError>> + Send + 'static,
    {
        // Store reads happen before the shard lock is taken.
        let cold = self.slots.get(key).map_or(true, |slot| slot.entry.is_none());
        let hydrated = if cold { self.hydrate(key, ttl) } else { None };

        // The map guard must be released before awaiting.
        let pending = {
            let mut slot = self.slots.entry(key.to_string()).or_default();
            if slot.entry.is_none() {
                slot.entry = hydrated;
            }
            if let Some(entry) = &slot.entry {
                if !is_expired(entry.expires_at, Utc::now()) {
                    return Ok(entry.value.clone());
                }
            }
            match slot.inflight.clone() {
                Some(pending) => pending,
                None => {
                    debug!(mention = key, "refreshing on-call cache entry");
                    let pending = refresh().boxed().shared();
                    slot.inflight = Some(pending.clone());
                    pending
                }
            }
        };

        let outcome = pending.clone().await;

        let mut settled = None;
        let stale = {
            let mut slot = self.slots.entry(key.to_string()).or_default();
            let owns_flight = slot
                .inflight
                .as_ref()
                .is_some_and(|f| Shared::ptr_eq(f, &pending));
            if owns_flight {
                slot.inflight = None;
                if let Ok(value) = &outcome {
                    slot.entry = Some(CacheEntry {
                        value: value.clone(),
                        expires_at: expires_at(Utc::now(), ttl),
                    });
                    settled = Some(value.clone());
                }
            }
            slot.entry.as_ref().map(|e| e.value.clone())
        };
        if let Some(value) = settled {
            self.persist(key, &value);
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(err) => match stale {
                Some(previous) => {
                    warn!(mention = key, error = %err, "on-call refresh failed; serving stale entry");
                    Ok(previous)
                }
                None => Err(err),
            },
        }
    }

    /// Drops every in-memory entry. Refreshes already in flight still finish
    /// for the callers awaiting them.
    pub fn clear(&self) {
        self.cleared_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        self.slots.clear();
    }

    fn hydrate(&self, key: &str, ttl: Duration) -> Option<CacheEntry> {
        let store = self.store.as_ref()?;
        let bytes = match store.get(&store_key(key)) {
            Ok(v) => v?,
            Err(e) => {
                warn!(mention = key, error = %e, "reading persisted on-call entry failed");
                return None;
            }
        };
        match serde_json::from_slice::<OnCallResult>(&bytes) {
            Ok(mut value) => {
                value.identities = union_identities([value.identities]);
                let cleared_at_ms = self.cleared_at_ms.load(Ordering::SeqCst);
                let expires_at = if value.fetched_at.timestamp_millis() <= cleared_at_ms {
                    value.fetched_at
                } else {
                    expires_at(value.fetched_at, ttl)
                };
                Some(CacheEntry { value, expires_at })
            }
            Err(e) => {
                let err = ResolveError::Decode(e.to_string());
                warn!(mention = key, error = %err, "ignoring persisted on-call entry");
                None
            }
        }
    }

    fn persist(&self, key: &str, value: &OnCallResult) {
        let Some(store) = &self.store else {
            return;
        };
        let written = serde_json::to_vec(value)
            .map_err(|e| e.to_string())
            .and_then(|bytes| store.set(&store_key(key), &bytes, self.retention_secs));
        if let Err(e) = written {
            warn!(mention = key, error = %e, "persisting on-call entry failed");
        }
    }
}

impl Default for OnCallCache {
    fn default() -> Self {
        Self::new()
    }
}

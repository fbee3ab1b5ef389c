use crate::config::CacheTtls;
use crate::credentials::{
    normalize_credentials, short_hash_hex, token_expiry, AccountSummary, CanonicalBlob,
};
use crate::error::SyncResult;
use crate::system_store::SystemCredentialStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAP_PRUNE_BOUND: usize = 64;
const VALIDITY_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct TtlEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V: Clone> TtlEntry<V> {
    fn new(value: V, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            expires_at: now + ttl,
        }
    }

    fn live(&self, now: Instant) -> Option<V> {
        (now < self.expires_at).then(|| self.value.clone())
    }
}

/// Content-keyed entries. Expired entries are only dropped once the map grows
/// to the prune bound.
#[derive(Debug)]
struct TtlMap<V> {
    entries: HashMap<String, TtlEntry<V>>,
    bound: usize,
}

impl<V: Clone> TtlMap<V> {
    fn new(bound: usize) -> Self {
        Self {
            entries: HashMap::new(),
            bound,
        }
    }

    fn get(&self, key: &str, now: Instant) -> Option<V> {
        self.entries.get(key).and_then(|entry| entry.live(now))
    }

    fn insert(&mut self, key: String, value: V, ttl: Duration, now: Instant) {
        if self.entries.len() >= self.bound && !self.entries.contains_key(&key) {
            self.entries.retain(|_, entry| now < entry.expires_at);
            if self.entries.len() >= self.bound {
                let soonest = self
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(key, _)| key.clone());
                if let Some(soonest) = soonest {
                    self.entries.remove(&soonest);
                }
            }
        }
        self.entries.insert(key, TtlEntry::new(value, ttl, now));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct CacheState {
    raw: Option<TtlEntry<Option<String>>>,
    validity: Option<TtlEntry<bool>>,
    last_known_validity: Option<bool>,
    last_validity_refresh: Option<Instant>,
    write_generation: u64,
    summaries: TtlMap<Option<AccountSummary>>,
    expiries: TtlMap<Option<DateTime<Utc>>>,
}

struct CacheInner {
    store: Arc<SystemCredentialStore>,
    ttls: CacheTtls,
    state: Mutex<CacheState>,
    refresh_in_flight: AtomicBool,
    validity_refreshes: AtomicU64,
}

/// Short-lived facts about the system credential. The state lock is never
/// held across keychain or file I/O.
#[derive(Clone)]
pub struct CredentialCache {
    inner: Arc<CacheInner>,
}

impl CredentialCache {
    pub fn new(store: Arc<SystemCredentialStore>, ttls: CacheTtls) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                ttls,
                state: Mutex::new(CacheState {
                    raw: None,
                    validity: None,
                    last_known_validity: None,
                    last_validity_refresh: None,
                    write_generation: 0,
                    summaries: TtlMap::new(MAP_PRUNE_BOUND),
                    expiries: TtlMap::new(MAP_PRUNE_BOUND),
                }),
                refresh_in_flight: AtomicBool::new(false),
                validity_refreshes: AtomicU64::new(0),
            }),
        }
    }

    pub fn system_store(&self) -> &SystemCredentialStore {
        &self.inner.store
    }

    pub fn read_credentials(&self, force_refresh: bool) -> SyncResult<Option<String>> {
        self.inner.read_credentials(force_refresh)
    }

    /// Writes through to the system store and primes the raw cache. Reads
    /// that started before the write never replace what it primed.
    pub fn write_credentials(&self, blob: &str) -> SyncResult<()> {
        let canonical = normalize_credentials(blob)?;
        self.inner.store.write_system_credentials(&canonical)?;
        let now = Instant::now();
        let mut state = self.inner.lock_state();
        state.write_generation += 1;
        state.raw = Some(TtlEntry::new(
            Some(canonical),
            self.inner.ttls.raw_credentials,
            now,
        ));
        state.validity = None;
        Ok(())
    }

    /// Never blocks on I/O. A cache miss answers with the last known value
    /// (`false` before the first refresh) and schedules a background refresh.
    pub fn is_current_login_valid(&self) -> bool {
        let stale = {
            let state = self.inner.lock_state();
            if let Some(valid) = state
                .validity
                .as_ref()
                .and_then(|entry| entry.live(Instant::now()))
            {
                return valid;
            }
            state.last_known_validity.unwrap_or(false)
        };
        self.request_validity_refresh(false);
        stale
    }

    /// Starts a background validity refresh unless one is already running or
    /// the last one started less than the minimum interval ago. `force`
    /// bypasses the interval but never the in-flight check. Returns whether a
    /// refresh was started.
    pub fn request_validity_refresh(&self, force: bool) -> bool {
        {
            let mut state = self.inner.lock_state();
            let now = Instant::now();
            if !force {
                if let Some(last) = state.last_validity_refresh {
                    if now.duration_since(last) < self.inner.ttls.min_refresh_interval {
                        return false;
                    }
                }
            }
            if self
                .inner
                .refresh_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            state.last_validity_refresh = Some(now);
        }

        self.inner.validity_refreshes.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("cxauth-validity".to_string())
            .spawn(move || {
                inner.refresh_validity();
                inner.refresh_in_flight.store(false, Ordering::Release);
            });
        if let Err(err) = spawned {
            warn!(error = %err, "failed to start validity refresh");
            self.inner.refresh_in_flight.store(false, Ordering::Release);
            return false;
        }
        true
    }

    pub fn account_summary(&self, blob: &str) -> Option<AccountSummary> {
        let key = short_hash_hex(blob.as_bytes());
        let now = Instant::now();
        if let Some(cached) = self.inner.lock_state().summaries.get(&key, now) {
            return cached;
        }
        let summary = AccountSummary::from_blob(blob);
        self.inner.lock_state().summaries.insert(
            key,
            summary.clone(),
            self.inner.ttls.account_summary,
            now,
        );
        summary
    }

    pub fn token_expiry(&self, blob: &str) -> Option<DateTime<Utc>> {
        let key = short_hash_hex(blob.as_bytes());
        let now = Instant::now();
        if let Some(cached) = self.inner.lock_state().expiries.get(&key, now) {
            return cached;
        }
        let expiry = token_expiry(blob);
        self.inner
            .lock_state()
            .expiries
            .insert(key, expiry, self.inner.ttls.token_expiry, now);
        expiry
    }

    #[cfg(test)]
    pub fn validity_refreshes(&self) -> u64 {
        self.inner.validity_refreshes.load(Ordering::Relaxed)
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.inner.refresh_in_flight.load(Ordering::Acquire)
    }

    /// Blocking variant for one-shot callers: kicks a refresh if needed and
    /// waits up to `timeout` for it before answering.
    pub fn wait_for_validity(&self, timeout: Duration) -> bool {
        let stale = self.is_current_login_valid();
        let deadline = Instant::now() + timeout;
        while self.refresh_in_flight() {
            if Instant::now() >= deadline {
                return stale;
            }
            thread::sleep(VALIDITY_POLL_INTERVAL);
        }
        self.is_current_login_valid()
    }
}

impl CacheInner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_credentials(&self, force_refresh: bool) -> SyncResult<Option<String>> {
        let generation = {
            let state = self.lock_state();
            if !force_refresh {
                if let Some(raw) = state.raw.as_ref().and_then(|entry| entry.live(Instant::now())) {
                    return Ok(raw);
                }
            }
            state.write_generation
        };

        let fresh = self.store.read_system_credentials()?;
        let mut state = self.lock_state();
        if state.write_generation != generation {
            debug!("discarding system read that raced a credential write");
            return Ok(state
                .raw
                .as_ref()
                .and_then(|entry| entry.live(Instant::now()))
                .unwrap_or(fresh));
        }
        state.raw = Some(TtlEntry::new(
            fresh.clone(),
            self.ttls.raw_credentials,
            Instant::now(),
        ));
        state.validity = None;
        Ok(fresh)
    }

    fn refresh_validity(&self) -> bool {
        let generation = self.lock_state().write_generation;
        let valid = match self.read_credentials(false) {
            Ok(blob) => blob_is_usable(blob.as_deref()),
            Err(err) => {
                warn!(step = "refresh_validity", error = %err, "validity refresh failed");
                return self.lock_state().last_known_validity.unwrap_or(false);
            }
        };

        let mut state = self.lock_state();
        let valid = if state.write_generation == generation {
            valid
        } else {
            // A write landed mid-refresh; judge the credential it primed.
            match state.raw.as_ref().and_then(|entry| entry.live(Instant::now())) {
                Some(raw) => blob_is_usable(raw.as_deref()),
                None => return state.last_known_validity.unwrap_or(false),
            }
        };
        state.validity = Some(TtlEntry::new(valid, self.ttls.validity, Instant::now()));
        state.last_known_validity = Some(valid);
        debug!(valid, "refreshed login validity");
        valid
    }
}

fn blob_is_usable(blob: Option<&str>) -> bool {
    blob.and_then(CanonicalBlob::parse)
        .map(|parsed| parsed.is_usable_at(Utc::now()))
        .unwrap_or(false)
}

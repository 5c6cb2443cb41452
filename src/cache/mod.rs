//! The service cache: single-flight loads, opportunistic prefetch and
//! lazy expiry cleanup over per-key entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConsulConfig;
use crate::consul::ConsulClient;
use crate::error::LookupError;
use crate::metrics;

pub mod entry;

pub use entry::{AddressFamily, Endpoint, ServiceKey};
use entry::{FetchOutcome, ServiceEntry};

/// A cleanup pass runs once every this many lookups, cache-wide.
const CLEANUP_INTERVAL: u64 = 1000;

/// What a lookup resolved to.
#[derive(Debug)]
pub struct Resolution {
    /// The selected endpoint; `None` when the service has no healthy
    /// endpoints (NXDOMAIN at the DNS layer).
    pub endpoint: Option<Endpoint>,
    /// Time left until the entry expires, clamped to zero.
    pub ttl: Duration,
}

/// Keyed store of service entries resolved against a Consul agent.
///
/// Handles are cheap to clone and share one underlying cache.
#[derive(Clone)]
pub struct ServiceCache {
    inner: Arc<Inner>,
}

struct Inner {
    client: ConsulClient,
    ttl: Duration,
    prefetch_amount: u64,
    prefetch_percentage: u32,
    entries: RwLock<HashMap<ServiceKey, Arc<ServiceEntry>>>,
    lookup_count: AtomicU64,
    cleanup_lock: AtomicBool,
    rng: Mutex<SmallRng>,
}

impl ServiceCache {
    /// Create a cache resolving through `client` with the given settings.
    pub fn new(client: ConsulClient, config: &ConsulConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                ttl: config.ttl(),
                prefetch_amount: config.prefetch.amount,
                prefetch_percentage: config.prefetch.percentage,
                entries: RwLock::new(HashMap::new()),
                lookup_count: AtomicU64::new(0),
                cleanup_lock: AtomicBool::new(false),
                rng: Mutex::new(SmallRng::from_entropy()),
            }),
        }
    }

    /// Resolve `key` at time `now`.
    ///
    /// Returns promptly from an initialised entry; the first call for a
    /// key performs the upstream fetch, and concurrent callers wait on
    /// the entry's ready signal. Negative entries return their stored
    /// error until they expire. Successive calls rotate through the
    /// endpoint set round-robin.
    pub async fn lookup(
        &self,
        cancel: &CancellationToken,
        key: &ServiceKey,
        now: Instant,
    ) -> Result<Resolution, LookupError> {
        if cancel.is_cancelled() {
            return Err(LookupError::Cancelled);
        }

        let mut entry = self.grab_or_create(key, now);
        let i = entry.next_lookup();

        let wants_fetch = i == 1
            || (i >= self.inner.prefetch_amount && now >= entry.prefetch_deadline);
        if wants_fetch && entry.begin_loading() {
            if !entry.is_initialized() {
                metrics::record_miss();
                let outcome = self.load(key).await;
                self.account_insert(&outcome);
                entry.publish(outcome);
                entry.finish_loading();
            } else {
                metrics::record_prefetch();
                let outcome = self.load(key).await;
                self.account_insert(&outcome);
                let (expires_at, prefetch_deadline) = self.entry_times(now);
                let fresh = Arc::new(ServiceEntry::refreshed(
                    outcome,
                    expires_at,
                    prefetch_deadline,
                ));
                let old = self
                    .inner
                    .entries
                    .write()
                    .insert(key.clone(), Arc::clone(&fresh));
                if let Some(old) = old {
                    self.account_remove(&old);
                }
                // The replaced entry keeps its loading latch engaged:
                // stragglers still holding it must not start a second
                // fetch for the key.
                entry = fresh;
            }
        }

        self.maybe_cleanup(now);

        let outcome = match entry.outcome() {
            Some(outcome) => outcome.clone(),
            None => entry.wait_ready(cancel).await?,
        };

        match outcome {
            Err(err) => {
                metrics::record_hit_denial();
                Err(err)
            }
            Ok(endpoints) => {
                metrics::record_hit_success();
                let ttl = entry.expires_at.saturating_duration_since(now);
                let endpoint = if endpoints.is_empty() {
                    None
                } else {
                    let index = ((i - 1) % endpoints.len() as u64) as usize;
                    Some(endpoints[index].clone())
                };
                Ok(Resolution { endpoint, ttl })
            }
        }
    }

    /// Fetch the entry for `key`, inserting a cold one if absent.
    fn grab_or_create(&self, key: &ServiceKey, now: Instant) -> Arc<ServiceEntry> {
        {
            let map = self.inner.entries.read();
            if let Some(entry) = map.get(key) {
                return Arc::clone(entry);
            }
        }
        let (expires_at, prefetch_deadline) = self.entry_times(now);
        let mut map = self.inner.entries.write();
        Arc::clone(
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(ServiceEntry::cold(expires_at, prefetch_deadline))),
        )
    }

    /// Expiration and prefetch deadline for an entry created at `now`.
    ///
    /// Expiration is jittered into `[now + ttl, now + 1.5 ttl)` so caches
    /// filled at boot do not expire in lockstep. The prefetch divisor is
    /// 1000, making the effective lead a tenth of the configured
    /// percentage; kept as-is to match observed behavior.
    fn entry_times(&self, now: Instant) -> (Instant, Instant) {
        let ttl = self.inner.ttl;
        let jitter_bound = (ttl / 2).as_nanos() as u64;
        let jitter = if jitter_bound == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.inner.rng.lock().gen_range(0..jitter_bound))
        };
        let expires_at = now + ttl + jitter;
        let prefetch_deadline = expires_at - ttl * self.inner.prefetch_percentage / 1000;
        (expires_at, prefetch_deadline)
    }

    /// Fetch endpoints for `key` from the agent and shuffle them.
    async fn load(&self, key: &ServiceKey) -> FetchOutcome {
        let started = Instant::now();
        let result = self.inner.client.service_endpoints(key).await;
        let rtt = started.elapsed();
        metrics::record_fetch_duration(rtt);

        match result {
            Ok(mut endpoints) => {
                endpoints.shuffle(&mut *self.inner.rng.lock());
                metrics::record_fetch_size(endpoints.len());
                info!(key = %key, ?rtt, endpoints = endpoints.len(), "fetch completed");
                Ok(Arc::from(endpoints))
            }
            Err(err) => {
                warn!(key = %key, ?rtt, error = %err, "fetch failed, caching negative entry");
                Err(LookupError::Upstream(Arc::new(err)))
            }
        }
    }

    /// Every [`CLEANUP_INTERVAL`]th lookup walks the map and drops
    /// initialised entries past their expiration. The walk reacquires the
    /// lock between entries and compares identity before deleting so a
    /// concurrent refresh is never clobbered.
    fn maybe_cleanup(&self, now: Instant) {
        let n = self.inner.lookup_count.fetch_add(1, Ordering::Relaxed) + 1;
        if n % CLEANUP_INTERVAL != 0 {
            return;
        }
        if self
            .inner
            .cleanup_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let keys: Vec<ServiceKey> = self.inner.entries.read().keys().cloned().collect();
        for key in keys {
            let candidate = self.inner.entries.read().get(&key).cloned();
            let Some(entry) = candidate else { continue };
            if !entry.is_initialized() || now < entry.expires_at {
                continue;
            }

            let removed = {
                let mut map = self.inner.entries.write();
                match map.get(&key) {
                    Some(current) if Arc::ptr_eq(current, &entry) => {
                        map.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                metrics::record_eviction();
                self.account_remove(&entry);
                match entry.outcome() {
                    Some(Ok(endpoints)) => {
                        debug!(key = %key, endpoints = endpoints.len(), "cache entry expired")
                    }
                    _ => debug!(key = %key, "negative cache entry expired"),
                }
            }
        }

        self.inner.cleanup_lock.store(false, Ordering::Release);
    }

    fn account_insert(&self, outcome: &FetchOutcome) {
        match outcome {
            Ok(endpoints) => metrics::record_entry_success(1, endpoints.len()),
            Err(_) => metrics::record_entry_denial(1),
        }
    }

    fn account_remove(&self, entry: &ServiceEntry) {
        match entry.outcome() {
            Some(Ok(endpoints)) => metrics::record_entry_success(-1, endpoints.len()),
            Some(Err(_)) => metrics::record_entry_denial(-1),
            None => {}
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    #[cfg(test)]
    fn entry(&self, key: &ServiceKey) -> Option<Arc<ServiceEntry>> {
        self.inner.entries.read().get(key).cloned()
    }
}

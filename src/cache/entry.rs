//! Service keys, endpoints and cache entries.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::Notify;

use crate::error::LookupError;

/// The address family a service key resolves for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4 only (`A` queries).
    V4,
    /// IPv6 only (`AAAA` queries).
    V6,
    /// Either family (`ANY`; `SRV` queries collapse to this).
    Any,
}

impl AddressFamily {
    /// Whether `addr` belongs to this family.
    pub fn matches(self, addr: IpAddr) -> bool {
        match self {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
            AddressFamily::Any => true,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            AddressFamily::V4 => "A",
            AddressFamily::V6 => "AAAA",
            AddressFamily::Any => "ANY",
        }
    }
}

/// Identifies one cached service resolution.
///
/// Keys are immutable and compared structurally. Case is preserved as
/// received; the DNS layer lowers names before keys are built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    name: String,
    tag: String,
    dc: String,
    family: AddressFamily,
}

impl ServiceKey {
    /// Build a key from its parts.
    pub fn new(name: &str, tag: &str, dc: &str, family: AddressFamily) -> Self {
        Self {
            name: name.to_string(),
            tag: tag.to_string(),
            dc: dc.to_string(),
            family,
        }
    }

    /// The service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tag filter, empty for none.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The datacenter, empty for the agent default.
    pub fn dc(&self) -> &str {
        &self.dc
    }

    /// The requested address family.
    pub fn family(&self) -> AddressFamily {
        self.family
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.family.as_str())?;
        if !self.tag.is_empty() {
            write!(f, "{}.", self.tag)?;
        }
        write!(f, "{}.service", self.name)?;
        if !self.dc.is_empty() {
            write!(f, ".{}", self.dc)?;
        }
        write!(f, ".consul")
    }
}

/// One resolved service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Service address.
    pub addr: IpAddr,
    /// Service port.
    pub port: u16,
    /// Fully-qualified node name (trailing dot included).
    pub node: String,
}

/// What a completed fetch left behind: the endpoints, or the memoised
/// error of a negative entry.
pub(crate) type FetchOutcome = Result<Arc<[Endpoint]>, LookupError>;

/// Cache record for one service key.
///
/// An entry is created cold by the cache on first reference and is only
/// ever mutated through its latches and counter; a refresh replaces the
/// entry wholesale in the map. Once the outcome is published the ready
/// signal is permanently released and reads are lock-free.
pub(crate) struct ServiceEntry {
    /// When this entry stops being served (jittered, see the cache).
    pub(crate) expires_at: Instant,
    /// Once enough lookups have accumulated, a lookup past this point
    /// refreshes the entry.
    pub(crate) prefetch_deadline: Instant,
    /// Released when the first load completes.
    ready: Notify,
    /// Set exactly once, by the fetcher that wins the loading latch.
    outcome: OnceLock<FetchOutcome>,
    /// Lookup counter; drives round-robin and the fetch decision.
    lookups: AtomicU64,
    /// Single-flight latch: at most one fetch in flight per entry.
    loading: AtomicBool,
}

impl ServiceEntry {
    /// A cold entry: no outcome yet, first lookup will fetch.
    pub(crate) fn cold(expires_at: Instant, prefetch_deadline: Instant) -> Self {
        Self {
            expires_at,
            prefetch_deadline,
            ready: Notify::new(),
            outcome: OnceLock::new(),
            lookups: AtomicU64::new(0),
            loading: AtomicBool::new(false),
        }
    }

    /// A refreshed entry, pre-initialised so it is never treated as cold.
    pub(crate) fn refreshed(
        outcome: FetchOutcome,
        expires_at: Instant,
        prefetch_deadline: Instant,
    ) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(outcome);
        Self {
            expires_at,
            prefetch_deadline,
            ready: Notify::new(),
            outcome: cell,
            lookups: AtomicU64::new(1),
            loading: AtomicBool::new(false),
        }
    }

    /// Increment the lookup counter and return its new value.
    ///
    /// The value `1` identifies the lookup that must trigger the first
    /// fetch; values `i` drive round-robin selection at `(i - 1) % len`.
    pub(crate) fn next_lookup(&self) -> u64 {
        self.lookups.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Try to become the single fetcher for this entry.
    pub(crate) fn begin_loading(&self) -> bool {
        self.loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the loading latch.
    pub(crate) fn finish_loading(&self) {
        self.loading.store(false, Ordering::Release);
    }

    /// Whether the first load has completed.
    pub(crate) fn is_initialized(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// The published outcome, if any.
    pub(crate) fn outcome(&self) -> Option<&FetchOutcome> {
        self.outcome.get()
    }

    /// Publish the first outcome in place and release the ready signal.
    pub(crate) fn publish(&self, outcome: FetchOutcome) {
        let _ = self.outcome.set(outcome);
        self.ready.notify_waiters();
    }

    /// Wait until the outcome is published, or until `cancel` fires.
    pub(crate) async fn wait_ready(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<FetchOutcome, LookupError> {
        loop {
            if let Some(outcome) = self.outcome.get() {
                return Ok(outcome.clone());
            }
            let mut notified = std::pin::pin!(self.ready.notified());
            // Register interest before the re-check so a publish between
            // the check and the await cannot be missed.
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome.get() {
                return Ok(outcome.clone());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(LookupError::Cancelled),
            }
        }
    }
}

impl fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("expires_at", &self.expires_at)
            .field("initialized", &self.is_initialized())
            .field("lookups", &self.lookups.load(Ordering::Relaxed))
            .finish()
    }
}

//! Time-ordered sliding windows.
//!
//! Duplicate suppression and rate limiting both remember recent events for a
//! bounded period. Each window keeps its entries in arrival order so expired
//! ones are popped from the front; purging happens lazily on every check and
//! costs amortised O(1) per expired entry. Every window owns one lock.

use std::{
    collections::{HashSet, VecDeque},
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

fn expired(now: Instant, stamp: Instant, retention: Duration) -> bool {
    now.saturating_duration_since(stamp) >= retention
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct SeenEntries<K> {
    order: VecDeque<(Instant, K)>,
    keys: HashSet<K>,
}

impl<K: Clone + Eq + Hash> SeenEntries<K> {
    fn purge(&mut self, now: Instant, retention: Duration) -> usize {
        let mut purged = 0;
        while let Some((stamp, _)) = self.order.front() {
            if !expired(now, *stamp, retention) {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                self.keys.remove(&key);
                purged += 1;
            }
        }
        purged
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_front() {
            self.keys.remove(&key);
        }
    }
}

/// Remembers keys seen within a retention period.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use hyperroute::window::SeenWindow;
/// use tokio::time::Instant;
///
/// let window = SeenWindow::new(Duration::from_secs(10), None);
/// let now = Instant::now();
/// assert!(window.observe_at("a", now));
/// assert!(!window.observe_at("a", now + Duration::from_secs(9)));
/// assert!(window.observe_at("a", now + Duration::from_secs(10)));
/// ```
#[derive(Debug)]
pub struct SeenWindow<K> {
    retention: Duration,
    max_entries: Option<usize>,
    entries: Mutex<SeenEntries<K>>,
}

impl<K: Clone + Eq + Hash> SeenWindow<K> {
    /// Create a window forgetting keys after `retention`.
    ///
    /// With `max_entries` set, the oldest key is evicted once the window is
    /// full. A cap of zero remembers nothing, so every key reads as new.
    #[must_use]
    pub fn new(retention: Duration, max_entries: Option<usize>) -> Self {
        Self {
            retention,
            max_entries,
            entries: Mutex::new(SeenEntries {
                order: VecDeque::new(),
                keys: HashSet::new(),
            }),
        }
    }

    /// Record `key` at `now`, returning `true` if it was not already present.
    ///
    /// A repeated key keeps its first timestamp, so the window measures
    /// retention from the first sighting.
    pub fn observe_at(&self, key: K, now: Instant) -> bool {
        let mut entries = lock(&self.entries);
        entries.purge(now, self.retention);
        if entries.keys.contains(&key) {
            return false;
        }
        if let Some(max) = self.max_entries {
            if max == 0 {
                return true;
            }
            while entries.keys.len() >= max {
                entries.evict_oldest();
            }
        }
        entries.keys.insert(key.clone());
        entries.order.push_back((now, key));
        true
    }

    /// Record `key` using the current time.
    pub fn observe(&self, key: K) -> bool { self.observe_at(key, Instant::now()) }

    /// Drop keys older than the retention period, returning how many went.
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        lock(&self.entries).purge(now, self.retention)
    }

    /// Number of remembered keys.
    #[must_use]
    pub fn len(&self) -> usize { lock(&self.entries).keys.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Counts events within a sliding period and refuses those over a limit.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use hyperroute::window::RateWindow;
/// use tokio::time::Instant;
///
/// let window = RateWindow::new(Duration::from_secs(1), 2);
/// let now = Instant::now();
/// assert!(window.try_acquire_at(now));
/// assert!(window.try_acquire_at(now));
/// assert!(!window.try_acquire_at(now));
/// assert!(window.try_acquire_at(now + Duration::from_secs(1)));
/// ```
#[derive(Debug)]
pub struct RateWindow {
    period: Duration,
    limit: usize,
    stamps: Mutex<VecDeque<Instant>>,
}

impl RateWindow {
    #[must_use]
    pub fn new(period: Duration, limit: usize) -> Self {
        Self {
            period,
            limit,
            stamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Maximum number of events accepted per period.
    #[must_use]
    pub const fn limit(&self) -> usize { self.limit }

    /// Count an event at `now` unless the period already holds `limit`
    /// events. Refused events are not counted.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut stamps = lock(&self.stamps);
        Self::purge(&mut stamps, now, self.period);
        if stamps.len() >= self.limit {
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// Count an event using the current time.
    pub fn try_acquire(&self) -> bool { self.try_acquire_at(Instant::now()) }

    /// Forget events older than the period, returning how many went.
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        Self::purge(&mut lock(&self.stamps), now, self.period)
    }

    /// Events counted in the current period.
    #[must_use]
    pub fn len(&self) -> usize { lock(&self.stamps).len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn purge(stamps: &mut VecDeque<Instant>, now: Instant, period: Duration) -> usize {
        let before = stamps.len();
        while stamps.front().is_some_and(|stamp| expired(now, *stamp, period)) {
            stamps.pop_front();
        }
        before - stamps.len()
    }
}

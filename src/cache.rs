use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// TTL for counts written right after a like/unlike.
    pub fresh_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            fresh_ttl: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Normal,
    Fresh,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    count: u64,
    inserted_at: Instant,
    freshness: Freshness,
}

/// Per-article like counts with a time-to-live. Unbounded; stale entries are
/// dropped on read and by `sweep`.
pub struct StatsCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl StatsCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn ttl_for(&self, freshness: Freshness) -> Duration {
        match freshness {
            Freshness::Normal => self.config.ttl,
            Freshness::Fresh => self.config.fresh_ttl,
        }
    }

    fn is_stale(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) > self.ttl_for(entry.freshness)
    }

    pub fn get(&self, path: &str) -> Option<u64> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().ok()?;
        let entry = *entries.get(path)?;
        if self.is_stale(&entry, now) {
            entries.remove(path);
            return None;
        }
        Some(entry.count)
    }

    pub fn set(&self, path: &str, count: u64, freshness: Freshness) {
        let entry = CacheEntry {
            count,
            inserted_at: self.clock.now(),
            freshness,
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(path.to_string(), entry);
        }
    }

    pub fn invalidate(&self, path: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(path);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Drops every stale entry and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, entry| !self.is_stale(entry, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

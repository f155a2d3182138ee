use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::bucket::Bucket;
use crate::clock::Clock;
use crate::error::{AdmissionError, Result};
use crate::tier::{Tier, TierLimit};

/// Entries inspected per eviction round when the registry is at its cap.
const EVICTION_SAMPLE: usize = 32;

struct RegistryEntry {
    bucket: Arc<Bucket>,
    last_access: AtomicU64,
}

impl RegistryEntry {
    fn new(bucket: Bucket, now: u64) -> Self {
        Self {
            bucket: Arc::new(bucket),
            last_access: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.last_access.fetch_max(now, Ordering::Relaxed);
    }

    fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

/// Bounded concurrent map of `<identity>:<tier>` to bucket.
///
/// Buckets are built lazily on first use and dropped once idle for `idle_ttl`
/// or when the cap forces an approximate-LRU eviction.
pub struct BucketRegistry {
    buckets: DashMap<String, RegistryEntry>,
    max_entries: usize,
    idle_ttl_nanos: u64,
    clock: Arc<dyn Clock>,
}

impl BucketRegistry {
    pub fn new(max_entries: usize, idle_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            max_entries,
            idle_ttl_nanos: u64::try_from(idle_ttl.as_nanos()).unwrap_or(u64::MAX),
            clock,
        }
    }

    pub fn key(identity: &str, tier: Tier) -> String {
        format!("{}:{}", identity, tier.as_str())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_nanos(self.idle_ttl_nanos)
    }

    /// Return the bucket for `(identity, tier)`, building a full one on a miss.
    ///
    /// Racing callers on a missing key construct exactly one bucket; the shard
    /// lock held by the entry API makes the losers see the winner's instance.
    /// Fails with `RegistryFull` only if the cap is reached and eviction could
    /// not free a slot.
    pub fn get_or_create(&self, identity: &str, tier: Tier, limit: TierLimit) -> Result<Arc<Bucket>> {
        let key = Self::key(identity, tier);
        let now = self.clock.now_nanos();

        if let Some(entry) = self.buckets.get(&key) {
            entry.touch(now);
            return Ok(Arc::clone(&entry.bucket));
        }

        if self.buckets.len() >= self.max_entries {
            self.make_room(now);
            let len = self.buckets.len();
            if len >= self.max_entries {
                return Err(AdmissionError::RegistryFull {
                    len,
                    max: self.max_entries,
                });
            }
        }

        let entry = self.buckets.entry(key).or_insert_with(|| {
            debug!(
                target: "postnow_admission::registry",
                identity = %identity,
                tier = %tier,
                capacity = limit.capacity,
                "Creating bucket"
            );
            RegistryEntry::new(Bucket::new(limit.capacity, limit.window, now), now)
        });
        entry.touch(now);
        let bucket = Arc::clone(&entry.bucket);
        // Release the shard lock before eviction walks the map.
        drop(entry);

        self.shrink_to_cap(now);
        Ok(bucket)
    }

    /// Look up a bucket without creating or touching it.
    pub fn peek(&self, identity: &str, tier: Tier) -> Option<Arc<Bucket>> {
        self.buckets
            .get(&Self::key(identity, tier))
            .map(|entry| Arc::clone(&entry.bucket))
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every entry idle for at least `idle_ttl`. Returns how many went.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now_nanos();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, entry| !self.is_idle(entry.last_access(), now));
        let evicted = before.saturating_sub(self.buckets.len());

        debug!(
            target: "postnow_admission::registry",
            evicted,
            remaining = self.buckets.len(),
            "Swept idle buckets"
        );
        evicted
    }

    fn is_idle(&self, last_access: u64, now: u64) -> bool {
        now.saturating_sub(last_access) >= self.idle_ttl_nanos
    }

    /// Racing misses can all pass the size check before any of them inserts.
    /// Whoever lands over the cap evicts until the map fits again.
    fn shrink_to_cap(&self, now: u64) {
        for _ in 0..EVICTION_SAMPLE {
            if self.buckets.len() <= self.max_entries {
                return;
            }
            self.make_room(now);
        }
    }

    /// Free at least one slot: idle entries from a sample first, otherwise the
    /// least recently used entry of that sample.
    fn make_room(&self, now: u64) {
        let sample: Vec<(String, u64)> = self
            .buckets
            .iter()
            .take(EVICTION_SAMPLE)
            .map(|entry| (entry.key().clone(), entry.value().last_access()))
            .collect();

        let mut evicted = 0;
        for (key, last_access) in &sample {
            if self.is_idle(*last_access, now) && self.buckets.remove(key).is_some() {
                evicted += 1;
            }
        }

        if evicted == 0 {
            if let Some((key, last_access)) = sample.iter().min_by_key(|(_, last_access)| *last_access) {
                // Skip it if someone touched it since we looked.
                if self
                    .buckets
                    .remove_if(key, |_, entry| entry.last_access() == *last_access)
                    .is_some()
                {
                    evicted += 1;
                }
            }
        }

        debug!(
            target: "postnow_admission::registry",
            evicted,
            sampled = sample.len(),
            "Registry at capacity, evicted buckets"
        );
    }
}

impl std::fmt::Debug for BucketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRegistry")
            .field("len", &self.buckets.len())
            .field("max_entries", &self.max_entries)
            .field("idle_ttl", &self.idle_ttl())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry(max_entries: usize, clock: Arc<ManualClock>) -> BucketRegistry {
        BucketRegistry::new(max_entries, Duration::from_secs(3600), clock)
    }

    #[test]
    fn test_key_format() {
        assert_eq!(BucketRegistry::key("ip:203.0.113.7", Tier::Lenient), "ip:203.0.113.7:LENIENT");
        assert_eq!(BucketRegistry::key("user:alice", Tier::Authenticated), "user:alice:AUTHENTICATED");
    }

    #[test]
    fn test_same_key_returns_same_bucket() {
        let reg = registry(100, Arc::new(ManualClock::new()));
        let limit = TierLimit::per_minute(60);

        let first = reg.get_or_create("ip:1.2.3.4", Tier::Lenient, limit).unwrap();
        let second = reg.get_or_create("ip:1.2.3.4", Tier::Lenient, limit).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_tier_is_part_of_key() {
        let reg = registry(100, Arc::new(ManualClock::new()));

        let lenient = reg.get_or_create("ip:1.2.3.4", Tier::Lenient, TierLimit::per_minute(60)).unwrap();
        let strict = reg.get_or_create("ip:1.2.3.4", Tier::Strict, TierLimit::per_minute(10)).unwrap();
        assert!(!Arc::ptr_eq(&lenient, &strict));
        assert_eq!(strict.capacity(), 10);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_concurrent_miss_builds_one_bucket() {
        let reg = registry(100, Arc::new(ManualClock::new()));
        let limit = TierLimit::per_minute(60);

        let buckets: Vec<Arc<Bucket>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| s.spawn(|| reg.get_or_create("user:alice", Tier::Authenticated, limit).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(reg.len(), 1);
        assert!(buckets.iter().all(|b| Arc::ptr_eq(b, &buckets[0])));
    }

    #[test]
    fn test_sweep_drops_idle_entries_only() {
        let clock = Arc::new(ManualClock::new());
        let reg = registry(100, clock.clone());
        let limit = TierLimit::per_minute(60);

        reg.get_or_create("ip:old", Tier::Lenient, limit).unwrap();
        clock.advance(Duration::from_secs(1800));
        reg.get_or_create("ip:fresh", Tier::Lenient, limit).unwrap();
        clock.advance(Duration::from_secs(1800));

        assert_eq!(reg.sweep_idle(), 1);
        assert!(reg.peek("ip:old", Tier::Lenient).is_none());
        assert!(reg.peek("ip:fresh", Tier::Lenient).is_some());
    }

    #[test]
    fn test_access_resets_idle_timer() {
        let clock = Arc::new(ManualClock::new());
        let reg = registry(100, clock.clone());
        let limit = TierLimit::per_minute(60);

        reg.get_or_create("ip:busy", Tier::Lenient, limit).unwrap();
        clock.advance(Duration::from_secs(3000));
        reg.get_or_create("ip:busy", Tier::Lenient, limit).unwrap();
        clock.advance(Duration::from_secs(3000));

        assert_eq!(reg.sweep_idle(), 0);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_cap_evicts_least_recently_used() {
        let clock = Arc::new(ManualClock::new());
        let reg = registry(3, clock.clone());
        let limit = TierLimit::per_minute(60);

        for name in ["ip:a", "ip:b", "ip:c"] {
            reg.get_or_create(name, Tier::Lenient, limit).unwrap();
            clock.advance(Duration::from_secs(1));
        }
        // Touch `a` so `b` becomes the oldest.
        reg.get_or_create("ip:a", Tier::Lenient, limit).unwrap();

        reg.get_or_create("ip:d", Tier::Lenient, limit).unwrap();
        assert_eq!(reg.len(), 3);
        assert!(reg.peek("ip:b", Tier::Lenient).is_none());
        assert!(reg.peek("ip:a", Tier::Lenient).is_some());
        assert!(reg.peek("ip:d", Tier::Lenient).is_some());
    }

    #[test]
    fn test_concurrent_misses_stay_within_cap() {
        let reg = registry(4, Arc::new(ManualClock::new()));
        let limit = TierLimit::per_minute(60);

        std::thread::scope(|s| {
            for i in 0..16 {
                let reg = &reg;
                s.spawn(move || {
                    // Losing an eviction race may surface as RegistryFull.
                    let _ = reg.get_or_create(&format!("ip:10.0.0.{}", i), Tier::Lenient, limit);
                });
            }
        });

        assert!(reg.len() <= 4, "registry grew to {}", reg.len());
        assert!(!reg.is_empty());
    }

    #[test]
    fn test_evicted_bucket_comes_back_full() {
        let clock = Arc::new(ManualClock::new());
        let reg = registry(100, clock.clone());
        let limit = TierLimit::per_minute(2);

        let bucket = reg.get_or_create("ip:x", Tier::Lenient, limit).unwrap();
        bucket.try_take(2, clock.now_nanos());
        clock.advance(Duration::from_secs(3600));
        reg.sweep_idle();

        let bucket = reg.get_or_create("ip:x", Tier::Lenient, limit).unwrap();
        assert_eq!(bucket.available_tokens(clock.now_nanos()), 2);
    }

    #[test]
    fn test_hits_still_served_when_full() {
        let reg = registry(1, Arc::new(ManualClock::new()));
        let limit = TierLimit::per_minute(5);

        let first = reg.get_or_create("ip:only", Tier::Lenient, limit).unwrap();
        let again = reg.get_or_create("ip:only", Tier::Lenient, limit).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }
}

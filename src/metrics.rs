use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::tier::Tier;

#[derive(Debug, Default)]
struct TierCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
}

/// Process-wide admission counters.
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    exempt: AtomicU64,
    fail_open: AtomicU64,
    tiers: [TierCounters; 4],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierSnapshot {
    pub allowed: u64,
    pub denied: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
    pub exempt_requests: u64,
    pub fail_open_requests: u64,
    pub tiers: BTreeMap<&'static str, TierSnapshot>,
}

fn slot(tier: Tier) -> usize {
    match tier {
        Tier::Strict => 0,
        Tier::Moderate => 1,
        Tier::Authenticated => 2,
        Tier::Lenient => 3,
    }
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decision(&self, tier: Tier, allowed: bool) {
        let counters = &self.tiers[slot(tier)];
        if allowed {
            counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_exempt(&self) {
        self.exempt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fail_open(&self) {
        self.fail_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot {
            exempt_requests: self.exempt.load(Ordering::Relaxed),
            fail_open_requests: self.fail_open.load(Ordering::Relaxed),
            ..MetricsSnapshot::default()
        };

        for tier in Tier::ALL {
            let counters = &self.tiers[slot(tier)];
            let tier_snapshot = TierSnapshot {
                allowed: counters.allowed.load(Ordering::Relaxed),
                denied: counters.denied.load(Ordering::Relaxed),
            };
            snapshot.allowed_requests += tier_snapshot.allowed;
            snapshot.throttled_requests += tier_snapshot.denied;
            snapshot.tiers.insert(tier.as_str(), tier_snapshot);
        }

        snapshot.allowed_requests += snapshot.fail_open_requests;
        snapshot.total_requests = snapshot.allowed_requests + snapshot.throttled_requests + snapshot.exempt_requests;
        snapshot
    }
}

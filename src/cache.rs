//! Named cache regions and the bucket store built from them.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::RegistryConfig;
use crate::registry::BucketRegistry;

pub const RATE_LIMIT_BUCKETS: &str = "rate-limit-buckets";
pub const USERS: &str = "users";
pub const POSTS: &str = "posts";
pub const POST_STATS: &str = "postStats";
pub const RELATIONSHIPS: &str = "relationships";

const DEFAULT_MAX_ENTRIES: usize = 100_000;
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60 * 60);

/// Size ceiling and access expiry for one named region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionSpec {
    pub name: &'static str,
    pub max_entries: usize,
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,
}

/// Owns the region table. Application caches share one builder setting; the
/// bucket region takes its limits from the admission registry settings.
#[derive(Debug, Clone)]
pub struct CacheManager {
    regions: Vec<RegionSpec>,
}

impl CacheManager {
    pub fn new(registry: &RegistryConfig) -> Self {
        let shared = |name: &'static str| RegionSpec {
            name,
            max_entries: DEFAULT_MAX_ENTRIES,
            idle_ttl: DEFAULT_IDLE_TTL,
        };

        Self {
            regions: vec![
                RegionSpec {
                    name: RATE_LIMIT_BUCKETS,
                    max_entries: registry.max_entries,
                    idle_ttl: registry.idle_ttl,
                },
                shared(USERS),
                shared(POSTS),
                shared(POST_STATS),
                shared(RELATIONSHIPS),
            ],
        }
    }

    pub fn region(&self, name: &str) -> Option<&RegionSpec> {
        self.regions.iter().find(|region| region.name == name)
    }

    pub fn regions(&self) -> &[RegionSpec] {
        &self.regions
    }

    /// Build the bucket registry sized by the `rate-limit-buckets` region.
    pub fn bucket_registry(&self, clock: Arc<dyn Clock>) -> BucketRegistry {
        let region = self
            .region(RATE_LIMIT_BUCKETS)
            .cloned()
            .unwrap_or_else(|| RegionSpec {
                name: RATE_LIMIT_BUCKETS,
                max_entries: DEFAULT_MAX_ENTRIES,
                idle_ttl: DEFAULT_IDLE_TTL,
            });
        BucketRegistry::new(region.max_entries, region.idle_ttl, clock)
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(&RegistryConfig::default())
    }
}

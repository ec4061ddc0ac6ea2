// Remembers that a persistent store answered "not initialized", so that a
// burst of initialization checks before the first full write costs a single
// round-trip.
use crate::metrics_defs::{INIT_CHECK_CACHE_HIT, INIT_CHECK_CACHE_MISS};
use moka::sync::Cache;
use shared::counter;
use std::time::Duration;

/// How long the answer is kept when items are cached forever. Another
/// process may initialize the database at any time, so this stays short.
pub const FOREVER_MODE_TTL: Duration = Duration::from_secs(5);

pub struct InitCheckCache {
    uninitialized: Cache<(), ()>,
}

impl InitCheckCache {
    pub fn new(ttl: Duration) -> Self {
        let uninitialized = Cache::builder()
            .max_capacity(1)
            .time_to_live(ttl)
            .build();

        InitCheckCache { uninitialized }
    }

    pub fn remember_uninitialized(&self) {
        self.uninitialized.insert((), ());
    }

    pub fn is_known_uninitialized(&self) -> bool {
        let cache_hit = self.uninitialized.contains_key(&());
        let metric_def = if cache_hit {
            INIT_CHECK_CACHE_HIT
        } else {
            INIT_CHECK_CACHE_MISS
        };
        counter!(metric_def).increment(1);
        cache_hit
    }

    pub fn forget(&self) {
        self.uninitialized.invalidate_all();
    }
}

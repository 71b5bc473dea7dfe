//! Rate Limiting, Spam and Duplicate Suppression
//!
//! Per-sender tables used by both pipelines:
//! - [`RateLimiter`]: minimum interval between publishes per sender
//! - [`SpamFilter`]: static deny-list of scripted phrases
//! - [`DedupTable`]: last shown body per sender
//! - [`ErrorCooldown`]: last user-visible error per partition
//! - [`CombatCache`]: last seen combat level per sender
//!
//! Every table keys senders by their canonical name and carries
//! timestamps so [`ChatFilter::cleanup`] can bound its size.

mod spam;

pub use spam::SpamFilter;

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::clock::{millis, Clock};
use crate::config::LimitsConfig;
use crate::error::Rejection;
use crate::protocol::{canonical_name, is_reserved_name};

/// Minimum publish interval per sender
pub struct RateLimiter {
    min_interval_ms: u64,
    /// sender -> last accepted publish (ms)
    last_publish: DashMap<String, u64>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval_ms: millis(min_interval),
            last_publish: DashMap::new(),
        }
    }

    /// Claim a publish slot for `sender` at `now_ms`
    ///
    /// Returns false without touching the record while inside the window.
    pub fn can_publish(&self, sender: &str, now_ms: u64) -> bool {
        match self.last_publish.entry(canonical_name(sender)) {
            Entry::Occupied(mut last) => {
                if now_ms.saturating_sub(*last.get()) < self.min_interval_ms {
                    return false;
                }
                last.insert(now_ms);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now_ms);
                true
            }
        }
    }

    /// Drop records whose window has long passed
    pub fn cleanup(&self, now_ms: u64) {
        let window = self.min_interval_ms;
        self.last_publish
            .retain(|_, last| now_ms.saturating_sub(*last) < window);
    }

    pub fn len(&self) -> usize {
        self.last_publish.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_publish.is_empty()
    }
}

struct DedupEntry {
    body: String,
    seen_ms: u64,
}

/// Last shown message body per sender
pub struct DedupTable {
    retention_ms: u64,
    entries: DashMap<String, DedupEntry>,
}

impl DedupTable {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention_ms: millis(retention),
            entries: DashMap::new(),
        }
    }

    /// Whether `body` differs from the last body shown for `sender`
    ///
    /// With `record`, a new body also becomes the stored one. The compare
    /// and the store happen under the same shard lock.
    pub fn should_display(&self, sender: &str, body: &str, record: bool, now_ms: u64) -> bool {
        let key = canonical_name(sender);

        if !record {
            return self
                .entries
                .get(&key)
                .map_or(true, |entry| entry.body != body);
        }

        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().body == body {
                    return false;
                }
                entry.insert(DedupEntry {
                    body: body.to_string(),
                    seen_ms: now_ms,
                });
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(DedupEntry {
                    body: body.to_string(),
                    seen_ms: now_ms,
                });
                true
            }
        }
    }

    /// Forget one sender's last body
    pub fn forget(&self, sender: &str) {
        self.entries.remove(&canonical_name(sender));
    }

    pub fn cleanup(&self, now_ms: u64) {
        let retention = self.retention_ms;
        self.entries
            .retain(|_, entry| now_ms.saturating_sub(entry.seen_ms) < retention);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Suppresses repeated user-visible errors per partition
pub struct ErrorCooldown {
    cooldown_ms: u64,
    /// partition -> last shown (ms)
    shown: DashMap<String, u64>,
}

impl ErrorCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown_ms: millis(cooldown),
            shown: DashMap::new(),
        }
    }

    /// Claim the right to show an error for `partition`
    pub fn try_claim(&self, partition: &str, now_ms: u64) -> bool {
        match self.shown.entry(partition.to_string()) {
            Entry::Occupied(mut last) => {
                if now_ms.saturating_sub(*last.get()) < self.cooldown_ms {
                    return false;
                }
                last.insert(now_ms);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now_ms);
                true
            }
        }
    }

    pub fn cleanup(&self, now_ms: u64) {
        let cooldown = self.cooldown_ms;
        self.shown
            .retain(|_, last| now_ms.saturating_sub(*last) < cooldown);
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}

/// Combat levels seen on world-broadcast senders
///
/// Filled only from non-blocking lookups at routing time and read by the
/// receive pipeline's low-level filter.
pub struct CombatCache {
    retention_ms: u64,
    levels: DashMap<String, (u16, u64)>,
}

impl CombatCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention_ms: millis(retention),
            levels: DashMap::new(),
        }
    }

    pub fn record(&self, sender: &str, level: u16, now_ms: u64) {
        self.levels.insert(canonical_name(sender), (level, now_ms));
    }

    pub fn get(&self, sender: &str) -> Option<u16> {
        self.levels.get(&canonical_name(sender)).map(|e| e.0)
    }

    /// Whether `sender` is known to be below `threshold`; unknown is not
    pub fn is_below(&self, sender: &str, threshold: u16) -> bool {
        self.get(sender).is_some_and(|level| level < threshold)
    }

    pub fn cleanup(&self, now_ms: u64) {
        let retention = self.retention_ms;
        self.levels
            .retain(|_, (_, seen)| now_ms.saturating_sub(*seen) < retention);
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Sizes of the per-sender tables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub rate_limited_senders: usize,
    pub dedup_entries: usize,
    pub error_cooldowns: usize,
    pub cached_combat_levels: usize,
}

/// All per-sender tables, each behind its own sharded lock
pub struct ChatFilter {
    clock: Arc<dyn Clock>,
    spam: SpamFilter,
    rate: RateLimiter,
    dedup: DedupTable,
    cooldown: ErrorCooldown,
    combat: CombatCache,
}

impl ChatFilter {
    pub fn new(limits: &LimitsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            spam: SpamFilter::new(),
            rate: RateLimiter::new(limits.min_publish_interval),
            dedup: DedupTable::new(limits.dedup_retention),
            cooldown: ErrorCooldown::new(limits.error_cooldown),
            combat: CombatCache::new(limits.combat_cache_retention),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn is_spam(&self, body: &str) -> bool {
        self.spam.is_spam(body)
    }

    pub fn can_publish(&self, sender: &str) -> bool {
        self.rate.can_publish(sender, self.now_ms())
    }

    /// Outbound gate: spam, reserved name, then rate limit
    ///
    /// The rate limit is consumed last so a rejected message does not use
    /// up the sender's slot.
    pub fn check_publish(&self, body: &str, sender: &str) -> Result<(), Rejection> {
        if self.is_spam(body) {
            debug!("Publish from '{}' rejected: spam", sender);
            return Err(Rejection::Spam);
        }
        if is_reserved_name(sender) {
            debug!("Publish from '{}' rejected: reserved name", sender);
            return Err(Rejection::ReservedName);
        }
        if !self.can_publish(sender) {
            debug!("Publish from '{}' rejected: rate limited", sender);
            return Err(Rejection::RateLimited);
        }
        Ok(())
    }

    pub fn should_publish(&self, body: &str, sender: &str) -> bool {
        self.check_publish(body, sender).is_ok()
    }

    pub fn should_display(&self, sender: &str, body: &str, record: bool) -> bool {
        self.dedup.should_display(sender, body, record, self.now_ms())
    }

    /// Claim the notification slot for `partition`
    pub fn claim_error_slot(&self, partition: &str) -> bool {
        self.cooldown.try_claim(partition, self.now_ms())
    }

    pub fn dedup(&self) -> &DedupTable {
        &self.dedup
    }

    pub fn combat(&self) -> &CombatCache {
        &self.combat
    }

    pub fn record_combat_level(&self, sender: &str, level: u16) {
        self.combat.record(sender, level, self.now_ms());
    }

    /// Sweep every table against its retention
    pub fn cleanup(&self) {
        let now_ms = self.now_ms();
        let before = self.stats();

        self.rate.cleanup(now_ms);
        self.dedup.cleanup(now_ms);
        self.cooldown.cleanup(now_ms);
        self.combat.cleanup(now_ms);

        let after = self.stats();
        if after != before {
            debug!("Filter sweep: {:?} -> {:?}", before, after);
        }
    }

    pub fn stats(&self) -> FilterStats {
        FilterStats {
            rate_limited_senders: self.rate.len(),
            dedup_entries: self.dedup.len(),
            error_cooldowns: self.cooldown.len(),
            cached_combat_levels: self.combat.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn filter_with_clock() -> (ChatFilter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let filter = ChatFilter::new(&LimitsConfig::default(), clock.clone());
        (filter, clock)
    }

    #[test]
    fn test_rate_limit_window() {
        let (filter, clock) = filter_with_clock();

        assert!(filter.can_publish("Bob"));
        clock.set(50);
        assert!(!filter.can_publish("Bob"));
        clock.set(150);
        assert!(filter.can_publish("Bob"));
    }

    #[test]
    fn test_rejected_call_does_not_extend_window() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        assert!(limiter.can_publish("bob", 0));
        assert!(!limiter.can_publish("bob", 99));
        // Still measured from t=0, not t=99
        assert!(limiter.can_publish("bob", 100));
    }

    #[test]
    fn test_rate_limit_is_per_canonical_sender() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        assert!(limiter.can_publish("Big_Bob", 0));
        assert!(!limiter.can_publish("Big Bob", 10));
        assert!(limiter.can_publish("Alice", 10));
    }

    #[test]
    fn test_check_publish_order() {
        let (filter, _clock) = filter_with_clock();

        assert_eq!(filter.check_publish("Bye!", "Bob"), Err(Rejection::Spam));
        assert_eq!(
            filter.check_publish("hello", "MOD Zed"),
            Err(Rejection::ReservedName)
        );
        // Neither rejection consumed Bob's slot
        assert_eq!(filter.check_publish("hello", "Bob"), Ok(()));
        assert_eq!(
            filter.check_publish("hello again", "Bob"),
            Err(Rejection::RateLimited)
        );
    }

    #[test]
    fn test_dedup_peek_does_not_record() {
        let table = DedupTable::new(Duration::from_secs(60));
        assert!(table.should_display("Bob", "gz", false, 0));
        assert!(table.should_display("Bob", "gz", false, 0));
        assert!(table.should_display("Bob", "gz", true, 0));
        assert!(!table.should_display("Bob", "gz", false, 0));
        assert!(table.should_display("Bob", "ty", false, 0));
    }

    #[test]
    fn test_dedup_retention_sweep() {
        let table = DedupTable::new(Duration::from_millis(1_000));
        table.should_display("Bob", "gz", true, 0);
        table.should_display("Alice", "hi", true, 900);

        table.cleanup(1_000);
        assert_eq!(table.len(), 1);
        assert!(table.should_display("Bob", "gz", false, 1_000));
        assert!(!table.should_display("Alice", "hi", false, 1_000));
    }

    #[test]
    fn test_error_cooldown() {
        let cooldown = ErrorCooldown::new(Duration::from_secs(30 * 60));
        assert!(cooldown.try_claim("301", 0));
        assert!(!cooldown.try_claim("301", 60_000));
        assert!(cooldown.try_claim("302", 60_000));
        assert!(cooldown.try_claim("301", 30 * 60 * 1000));
    }

    #[test]
    fn test_combat_cache_unknown_is_not_below() {
        let cache = CombatCache::new(Duration::from_secs(60));
        assert!(!cache.is_below("Bob", 4));
        cache.record("Bob", 3, 0);
        assert!(cache.is_below("Bob", 4));
        assert!(!cache.is_below("Bob", 3));
        assert_eq!(cache.get("Bob"), Some(3));
    }

    #[test]
    fn test_cleanup_bounds_all_tables() {
        let (filter, clock) = filter_with_clock();
        filter.can_publish("Bob");
        filter.should_display("Bob", "gz", true);
        filter.claim_error_slot("301");
        filter.record_combat_level("Bob", 90);
        assert_eq!(
            filter.stats(),
            FilterStats {
                rate_limited_senders: 1,
                dedup_entries: 1,
                error_cooldowns: 1,
                cached_combat_levels: 1,
            }
        );

        clock.advance(Duration::from_secs(24 * 60 * 60));
        filter.cleanup();
        assert_eq!(filter.stats(), FilterStats::default());
    }

    proptest! {
        #[test]
        fn prop_second_identical_display_is_suppressed(sender in "[A-Za-z][A-Za-z0-9 ]{0,11}", body in ".{0,50}") {
            let table = DedupTable::new(Duration::from_secs(60));
            prop_assert!(table.should_display(&sender, &body, true, 0));
            prop_assert!(!table.should_display(&sender, &body, true, 1));
        }

        #[test]
        fn prop_publish_inside_window_is_rejected(gap in 0u64..100, later in 100u64..10_000) {
            let limiter = RateLimiter::new(Duration::from_millis(100));
            prop_assert!(limiter.can_publish("Bob", 0));
            prop_assert!(!limiter.can_publish("Bob", gap));
            prop_assert!(limiter.can_publish("Bob", later));
        }
    }
}

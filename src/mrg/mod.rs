//! Metric registry (spec.md §4.10), the cache's upstream collaborator: it
//! interns a metric's UUID and section into a dense `metric_id` the cache
//! uses as an index key, and tracks retention bounds the cache itself
//! never needs to know about. Grounded on the host's `storage/page.rs`
//! (its `PageId`/metadata split) generalized from a single page id to a
//! per-metric record with retention fields, and on the cache's own
//! partitioned index (`src/pgc/index.rs`) for the per-section sharding
//! spec.md §4.10 names as the registry's own contention-reduction strategy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{PgcError, Result};

/// One registered metric (spec.md §3 "Metric (MRG entry)").
pub struct Metric {
    pub uuid: Uuid,
    pub section: u64,
    pub metric_id: u64,
    first_time: AtomicU64,
    latest_clean_time: AtomicU64,
    latest_hot_time: AtomicU64,
    update_every: AtomicU32,
    writer: AtomicU64,
    refcount: AtomicU64,
}

pub type MetricHandle = Arc<Metric>;

impl Metric {
    pub fn first_time(&self) -> u64 {
        self.first_time.load(Ordering::Acquire)
    }

    pub fn set_first_time_if_lower(&self, t: u64) {
        self.first_time.fetch_min(t, Ordering::AcqRel);
    }

    pub fn latest_clean_time(&self) -> u64 {
        self.latest_clean_time.load(Ordering::Acquire)
    }

    pub fn update_latest_clean_time(&self, t: u64) {
        self.latest_clean_time.fetch_max(t, Ordering::AcqRel);
    }

    pub fn latest_hot_time(&self) -> u64 {
        self.latest_hot_time.load(Ordering::Acquire)
    }

    pub fn update_latest_hot_time(&self, t: u64) {
        self.latest_hot_time.fetch_max(t, Ordering::AcqRel);
    }

    /// The later of `latest_clean_time`/`latest_hot_time` (spec.md §4.10's
    /// deletability invariant treats them as a single "latest" bound).
    pub fn latest_time(&self) -> u64 {
        self.latest_clean_time().max(self.latest_hot_time())
    }

    /// Spec.md §4.10: a metric has no retention left to protect once
    /// `first_time == 0`, `latest == 0` (never written), or `first_time`
    /// has crossed past `latest` (every page it ever had has been evicted
    /// and nothing filled back in behind it).
    pub fn has_no_retention(&self) -> bool {
        let first = self.first_time();
        let latest = self.latest_time();
        first == 0 || latest == 0 || first > latest
    }

    pub fn update_every(&self) -> u32 {
        self.update_every.load(Ordering::Relaxed)
    }

    pub fn set_update_every(&self, v: u32) {
        self.update_every.store(v, Ordering::Relaxed);
    }

    pub fn writer(&self) -> u64 {
        self.writer.load(Ordering::Relaxed)
    }

    /// Claim the writer slot via CAS, failing if another writer already
    /// holds it. Mirrors the cache's own acquire-style contention model
    /// rather than a plain store, since exactly one writer may hold this
    /// metric at a time.
    pub fn claim_writer(&self, expected: u64, new: u64) -> bool {
        self.writer
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "invariant violated: metric refcount underflow");
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }
}

struct Shard {
    by_key: RwLock<HashMap<(Uuid, u64), MetricHandle>>,
    by_id: RwLock<HashMap<u64, MetricHandle>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            by_key: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
        }
    }
}

/// Fast hash used only to pick a shard; not security-sensitive. Mirrors
/// `pgc::index::partition_hash`.
#[inline]
fn shard_hash(section: u64, n: usize) -> usize {
    (section.wrapping_mul(0x9e3779b97f4a7c15) as usize) % n
}

fn default_shard_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Interns `(uuid, section)` pairs into dense `metric_id`s and stores their
/// retention metadata. Sharded per-section (spec.md §4.10 "MRG owns
/// per-section partitioning for contention reduction"): producers/readers
/// for distinct sections never contend on the same shard's lock. A small
/// flat `id_to_section` map routes `by_id` lookups to the right shard
/// without the caller needing to already know the section.
///
/// One-way dependency onto the cache: the cache never calls back into this
/// registry, producers/readers consult both independently (spec.md §9
/// "one-way MRG -> Cache dependency"). The one exception is
/// `recompute_first_time`, invoked from the deletion path itself.
pub struct MetricRegistry {
    shards: Vec<Shard>,
    id_to_section: RwLock<HashMap<u64, u64>>,
    next_id: AtomicU64,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::with_shards(default_shard_count())
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Shard::new()).collect(),
            id_to_section: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn shard_for(&self, section: u64) -> &Shard {
        &self.shards[shard_hash(section, self.shards.len())]
    }

    /// Register `uuid` under `section`, or return the existing entry.
    /// Mirrors the cache's own "insert returns existing" contract (spec.md
    /// §4.1) for symmetry, though the registry's locking is unrelated.
    pub fn add(&self, uuid: Uuid, section: u64, update_every: u32, writer: u64) -> MetricHandle {
        let key = (uuid, section);
        let shard = self.shard_for(section);
        if let Some(existing) = shard.by_key.read().get(&key) {
            existing.acquire();
            return existing.clone();
        }
        let mut by_key = shard.by_key.write();
        if let Some(existing) = by_key.get(&key) {
            existing.acquire();
            return existing.clone();
        }
        let metric_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let metric = Arc::new(Metric {
            uuid,
            section,
            metric_id,
            first_time: AtomicU64::new(0),
            latest_clean_time: AtomicU64::new(0),
            latest_hot_time: AtomicU64::new(0),
            update_every: AtomicU32::new(update_every),
            writer: AtomicU64::new(writer),
            refcount: AtomicU64::new(1),
        });
        by_key.insert(key, metric.clone());
        shard.by_id.write().insert(metric_id, metric.clone());
        self.id_to_section.write().insert(metric_id, section);
        metric
    }

    pub fn by_uuid(&self, uuid: Uuid, section: u64) -> Option<MetricHandle> {
        self.shard_for(section).by_key.read().get(&(uuid, section)).cloned()
    }

    pub fn by_id(&self, metric_id: u64) -> Option<MetricHandle> {
        let section = *self.id_to_section.read().get(&metric_id)?;
        self.shard_for(section).by_id.read().get(&metric_id).cloned()
    }

    /// Look up and acquire in one call, the common read-path pattern.
    pub fn get_and_acquire(&self, uuid: Uuid, section: u64) -> Option<MetricHandle> {
        let metric = self.by_uuid(uuid, section)?;
        metric.acquire();
        Some(metric)
    }

    /// Acquire an additional reference to an already-held metric.
    pub fn dup(&self, metric: &MetricHandle) -> MetricHandle {
        metric.acquire();
        metric.clone()
    }

    /// Release `metric`'s reference, then attempt deletion if this caller
    /// held the last reference beyond the registry's own (spec.md §4.10
    /// `release_and_delete`). Unlike `release` alone, a failed delete
    /// attempt (the metric is still referenced, or still has retention) is
    /// not an error -- the release itself always succeeds.
    pub fn release_and_delete(&self, metric: &MetricHandle, cache: &crate::pgc::Cache) -> Result<()> {
        metric.release();
        if metric.refcount() == 1 {
            self.del(metric.metric_id, cache)
        } else {
            Ok(())
        }
    }

    /// Unregister a metric. Requires the caller hold the only outstanding
    /// reference (refcount == 1, the registry's own), and that the metric
    /// has no retention left to protect (spec.md §4.10: `first_time==0 ||
    /// latest==0 || first_time>latest`). Before making that retention
    /// check, recomputes `first_time` against the cache to salvage true
    /// bounds that eviction may have shifted since the metric was last
    /// written (spec.md §4.10's stated reason `recompute_first_time`
    /// exists) -- otherwise a metric could be rejected for "still has
    /// retention" against a `first_time` that no longer corresponds to any
    /// live page.
    pub fn del(&self, metric_id: u64, cache: &crate::pgc::Cache) -> Result<()> {
        let section = *self
            .id_to_section
            .read()
            .get(&metric_id)
            .ok_or_else(|| PgcError::NotFound(format!("metric_id {metric_id}")))?;
        let shard = self.shard_for(section);

        let metric = {
            let by_id = shard.by_id.read();
            by_id
                .get(&metric_id)
                .cloned()
                .ok_or_else(|| PgcError::NotFound(format!("metric_id {metric_id}")))?
        };
        if metric.refcount() != 1 {
            return Err(PgcError::InvalidConfig(format!(
                "metric {metric_id} still referenced ({} refs)",
                metric.refcount()
            )));
        }

        self.recompute_first_time(&metric, cache);
        if !metric.has_no_retention() {
            return Err(PgcError::InvalidConfig(format!(
                "metric {metric_id} still has retention (first_time={}, latest={})",
                metric.first_time(),
                metric.latest_time()
            )));
        }

        shard.by_id.write().remove(&metric_id);
        shard.by_key.write().remove(&(metric.uuid, metric.section));
        self.id_to_section.write().remove(&metric_id);
        Ok(())
    }

    /// All currently-registered metrics. Supplements the source's
    /// enumerable-set gap (spec.md §9 Open Questions: "MRG destroy is a
    /// no-op in the source") so a caller can actually walk every metric
    /// before tearing the registry down.
    pub fn all(&self) -> Vec<MetricHandle> {
        self.shards.iter().flat_map(|s| s.by_id.read().values().cloned().collect::<Vec<_>>()).collect()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.by_id.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Explicit, ordered teardown for the whole registry (spec.md §9 Open
    /// Questions: "MRG destroy is a no-op in the source... a
    /// reimplementation should maintain an enumerable set"). Unlike `del`,
    /// this does not require callers to have released down to a single
    /// reference first -- it walks every shard and drops the registry's
    /// own references, mirroring `Cache::destroy`'s "tear everything down"
    /// semantics rather than `del`'s per-entry refcount discipline.
    pub fn destroy(&self) {
        for shard in &self.shards {
            shard.by_id.write().clear();
            shard.by_key.write().clear();
        }
        self.id_to_section.write().clear();
    }

    /// Re-derive `first_time` once a metric's earliest page may have been
    /// evicted: consults the cache directly for the page currently at
    /// `first_time`, and if it is gone, advances `first_time` to whatever
    /// the cache's own FIRST/NEXT search now reports (spec.md §9's "zero-
    /// retention recomputation calls back into `Cache::find`" -- the one
    /// exception to the otherwise one-way MRG -> Cache dependency).
    pub fn recompute_first_time(&self, metric: &MetricHandle, cache: &crate::pgc::Cache) {
        if metric.latest_clean_time() == 0 && metric.latest_hot_time() == 0 {
            return; // never written, nothing to recompute
        }
        let first = metric.first_time();
        if let Some(page) = cache.find(
            metric.section,
            metric.metric_id,
            first as i64,
            crate::pgc::SearchMethod::Exact,
        ) {
            cache.release(page);
            return;
        }
        if let Some(next) = cache.find(metric.section, metric.metric_id, first as i64, crate::pgc::SearchMethod::Next) {
            let next_start = next.key().start_time;
            cache.release(next);
            metric.first_time.store(next_start.max(0) as u64, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::pgc::{Cache, PageEntryDescriptor};
    use std::sync::Arc as StdArc;

    fn test_cache() -> StdArc<Cache> {
        let config = CacheConfig::builder()
            .partitions(2)
            .clean_size_floor(1)
            .free_clean_cb(Box::new(|_| {}))
            .save_dirty_cb(Box::new(|_, _: &[PageEntryDescriptor]| Ok(())))
            .build()
            .unwrap();
        Cache::new(config)
    }

    #[test]
    fn add_is_idempotent_per_uuid_section() {
        let mrg = MetricRegistry::new();
        let uuid = Uuid::new_v4();
        let a = mrg.add(uuid, 1, 1, 7);
        let b = mrg.add(uuid, 1, 1, 7);
        assert_eq!(a.metric_id, b.metric_id);
        assert_eq!(a.refcount(), 2);
    }

    #[test]
    fn distinct_sections_get_distinct_ids() {
        let mrg = MetricRegistry::new();
        let uuid = Uuid::new_v4();
        let a = mrg.add(uuid, 1, 1, 7);
        let b = mrg.add(uuid, 2, 1, 7);
        assert_ne!(a.metric_id, b.metric_id);
    }

    #[test]
    fn distinct_sections_land_in_distinct_shards_when_enough_shards_exist() {
        let mrg = MetricRegistry::with_shards(8);
        let uuid = Uuid::new_v4();
        for section in 0..8u64 {
            mrg.add(uuid, section, 1, 0);
        }
        assert_eq!(mrg.len(), 8);
    }

    #[test]
    fn del_rejects_still_referenced() {
        let mrg = MetricRegistry::new();
        let cache = test_cache();
        let uuid = Uuid::new_v4();
        let m = mrg.add(uuid, 1, 1, 7);
        m.acquire();
        assert!(mrg.del(m.metric_id, &cache).is_err());
        m.release();
        assert!(mrg.del(m.metric_id, &cache).is_ok());
    }

    #[test]
    fn del_rejects_metrics_that_still_have_retention() {
        let mrg = MetricRegistry::new();
        let cache = test_cache();
        let uuid = Uuid::new_v4();
        let m = mrg.add(uuid, 1, 1, 7);
        m.set_first_time_if_lower(10);
        m.update_latest_clean_time(100);

        // first_time (10) <= latest (100), and a page still lives at that
        // first_time, so recompute_first_time can't salvage past it.
        let page = cache.add_and_acquire(PageEntryDescriptor {
            section: 1,
            metric_id: m.metric_id,
            start_time: 10,
            end_time: 20,
            update_every: 1,
            size: 64,
            data: Arc::from(vec![0u8; 8]),
            custom_data: None,
            hot: false,
        });
        cache.release(page);

        assert!(mrg.del(m.metric_id, &cache).is_err());
    }

    #[test]
    fn all_enumerates_every_metric() {
        let mrg = MetricRegistry::new();
        mrg.add(Uuid::new_v4(), 1, 1, 0);
        mrg.add(Uuid::new_v4(), 1, 1, 0);
        assert_eq!(mrg.all().len(), 2);
        assert_eq!(mrg.len(), 2);
    }

    #[test]
    fn get_and_acquire_then_release_and_delete() {
        let mrg = MetricRegistry::new();
        let cache = test_cache();
        let uuid = Uuid::new_v4();
        let m = mrg.add(uuid, 1, 1, 7);
        m.release(); // drop the `add` caller's own ref, registry keeps one

        let got = mrg.get_and_acquire(uuid, 1).expect("metric should be found");
        assert_eq!(got.refcount(), 2);

        let dup = mrg.dup(&got);
        assert_eq!(dup.refcount(), 3);

        mrg.release_and_delete(&dup, &cache).unwrap();
        assert_eq!(got.refcount(), 2);
        assert!(mrg.by_id(got.metric_id).is_some());

        mrg.release_and_delete(&got, &cache).unwrap();
        assert!(mrg.by_id(got.metric_id).is_none());
    }

    #[test]
    fn destroy_walks_and_clears_every_entry() {
        let mrg = MetricRegistry::new();
        let a = mrg.add(Uuid::new_v4(), 1, 1, 0);
        let b = mrg.add(Uuid::new_v4(), 1, 1, 0);
        a.acquire(); // still-referenced entries are torn down too
        assert_eq!(mrg.len(), 2);

        mrg.destroy();
        assert_eq!(mrg.len(), 0);
        assert!(mrg.by_id(a.metric_id).is_none());
        assert!(mrg.by_uuid(b.uuid, b.section).is_none());
    }

    #[test]
    fn claim_writer_is_cas_guarded() {
        let mrg = MetricRegistry::new();
        let m = mrg.add(Uuid::new_v4(), 1, 1, 0);
        assert!(m.claim_writer(0, 42));
        assert_eq!(m.writer(), 42);
        assert!(!m.claim_writer(0, 99));
        assert!(m.claim_writer(42, 99));
    }
}

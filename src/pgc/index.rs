//! Partitioned `(section, metric_id, start_time) -> Page` index (spec.md
//! §4.1), grounded on the host's partitioned `PageTable`
//! (`src/buffer/manager.rs`): a `Vec` of independently `RwLock`-guarded
//! partitions, selected by hashing `metric_id`. Within a partition the
//! logical nesting `section -> metric -> start_time` is implemented with
//! nested `BTreeMap`s, which gives the exact-match, first/last, and
//! next/prev navigation the temporal search (§4.5) requires in O(log n).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::pgc::page::{Page, PageEntryDescriptor, PageHandle, PageState};

/// Search method for `Index::find` (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    Exact,
    Closest,
    First,
    Next,
    Prev,
    Last,
}

type StartTimeMap = BTreeMap<i64, PageHandle>;
type MetricMap = BTreeMap<u64, StartTimeMap>;
/// `section -> metric -> start_time`, matching spec.md §4.1's stated
/// nesting order. Partition *selection* is still by `metric_id` hash
/// (§4.1), independent of this in-partition nesting order.
type Partition = BTreeMap<u64, MetricMap>;

struct PartitionSlot {
    lock: RwLock<Partition>,
}

pub(crate) struct Index {
    partitions: Vec<PartitionSlot>,
    search_hits: AtomicUsize,
    search_misses: AtomicUsize,
    /// Total CAS retries observed across every `acquire()` call routed
    /// through this index, exposed for `Cache::statistics()`'s contention
    /// counters.
    cas_spins: AtomicUsize,
}

/// Fast hash used only to pick a partition; not security-sensitive.
#[inline]
fn partition_hash(metric_id: u64, n: usize) -> usize {
    (metric_id.wrapping_mul(0x9e3779b97f4a7c15) as usize) % n
}

pub(crate) enum InsertOutcome {
    Added(PageHandle),
    Existing(PageHandle),
}

impl Index {
    pub(crate) fn new(partitions: usize) -> Self {
        let mut v = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            v.push(PartitionSlot {
                lock: RwLock::new(BTreeMap::new()),
            });
        }
        Self {
            partitions: v,
            search_hits: AtomicUsize::new(0),
            search_misses: AtomicUsize::new(0),
            cas_spins: AtomicUsize::new(0),
        }
    }

    fn partition_for(&self, metric_id: u64) -> &PartitionSlot {
        &self.partitions[partition_hash(metric_id, self.partitions.len())]
    }

    /// Insert a new page, or return the existing one with a fresh
    /// reference acquired (spec.md §4.1 `insert` contract).
    pub(crate) fn insert(&self, desc: &PageEntryDescriptor) -> InsertOutcome {
        let slot = self.partition_for(desc.metric_id);
        let mut guard = slot.lock.write();
        let metric_map = guard.entry(desc.section).or_default();
        let start_map = metric_map.entry(desc.metric_id).or_default();

        if let Some(existing) = start_map.get(&desc.start_time) {
            let outcome = existing.acquire();
            self.cas_spins.fetch_add(outcome.spins as usize, Ordering::Relaxed);
            assert!(
                outcome.acquired,
                "invariant violated: index holds a page that could not be acquired under its own write lock"
            );
            return InsertOutcome::Existing(existing.clone());
        }

        let page = Page::new(desc);
        let first_ref = page.acquire();
        assert!(first_ref.acquired, "fresh page must always be acquirable");
        start_map.insert(desc.start_time, page.clone());
        InsertOutcome::Added(page)
    }

    /// Remove `page` from the index. Caller must hold the page's
    /// transition lock and have already marked it `being_deleted`
    /// (spec.md §4.1 `remove` contract).
    pub(crate) fn remove(&self, page: &Page) {
        let slot = self.partition_for(page.key.metric_id);
        let mut guard = slot.lock.write();
        if let Some(metric_map) = guard.get_mut(&page.key.section) {
            if let Some(start_map) = metric_map.get_mut(&page.key.metric_id) {
                start_map.remove(&page.key.start_time);
                if start_map.is_empty() {
                    metric_map.remove(&page.key.metric_id);
                }
            }
            if metric_map.is_empty() {
                guard.remove(&page.key.section);
            }
        }
    }

    /// Batch removal used by the evictor: removes every page in `pages`
    /// while holding each affected partition's write lock only once.
    pub(crate) fn remove_batch(&self, pages: &[PageHandle]) {
        use std::collections::HashMap;
        let mut by_partition: HashMap<usize, Vec<&PageHandle>> = HashMap::new();
        for p in pages {
            let idx = partition_hash(p.key.metric_id, self.partitions.len());
            by_partition.entry(idx).or_default().push(p);
        }
        for (idx, group) in by_partition {
            let mut guard = self.partitions[idx].lock.write();
            for page in group {
                if let Some(metric_map) = guard.get_mut(&page.key.section) {
                    if let Some(start_map) = metric_map.get_mut(&page.key.metric_id) {
                        start_map.remove(&page.key.start_time);
                        if start_map.is_empty() {
                            metric_map.remove(&page.key.metric_id);
                        }
                    }
                    if metric_map.is_empty() {
                        guard.remove(&page.key.section);
                    }
                }
            }
        }
    }

    /// Temporal search (spec.md §4.5). Acquires and returns a reference to
    /// the matching page, if any, before releasing the partition read lock.
    pub(crate) fn find(
        &self,
        section: u64,
        metric_id: u64,
        t: i64,
        method: SearchMethod,
    ) -> Option<PageHandle> {
        let slot = self.partition_for(metric_id);
        let guard = slot.lock.read();
        let start_map = guard.get(&section)?.get(&metric_id)?;

        let candidate = match method {
            SearchMethod::Exact => start_map.get(&t).cloned(),
            SearchMethod::First => start_map.values().next().cloned(),
            SearchMethod::Last => start_map.values().next_back().cloned(),
            SearchMethod::Next => start_map
                .range((std::ops::Bound::Excluded(t), std::ops::Bound::Unbounded))
                .next()
                .map(|(_, p)| p.clone()),
            SearchMethod::Prev => start_map
                .range((std::ops::Bound::Unbounded, std::ops::Bound::Excluded(t)))
                .next_back()
                .map(|(_, p)| p.clone()),
            SearchMethod::Closest => self.closest(start_map, t),
        };

        match candidate {
            Some(page) => {
                let outcome = page.acquire();
                self.cas_spins.fetch_add(outcome.spins as usize, Ordering::Relaxed);
                if !outcome.acquired {
                    // Page is mid-deletion; treat exactly like a miss.
                    self.search_misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                page.record_access();
                self.search_hits.fetch_add(1, Ordering::Relaxed);
                Some(page)
            }
            None => {
                self.search_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// CLOSEST resolution per spec.md §4.5 steps 2-4: exact match, else the
    /// prior page if it still covers `t`, else the next page.
    fn closest(&self, start_map: &StartTimeMap, t: i64) -> Option<PageHandle> {
        if let Some(exact) = start_map.get(&t) {
            return Some(exact.clone());
        }
        if let Some((_, prior)) = start_map
            .range((std::ops::Bound::Unbounded, std::ops::Bound::Excluded(t)))
            .next_back()
        {
            if prior.end_time() >= t {
                return Some(prior.clone());
            }
        }
        start_map
            .range((std::ops::Bound::Excluded(t), std::ops::Bound::Unbounded))
            .next()
            .map(|(_, p)| p.clone())
    }

    pub(crate) fn search_stats(&self) -> (usize, usize) {
        (
            self.search_hits.load(Ordering::Relaxed),
            self.search_misses.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn cas_spins(&self) -> usize {
        self.cas_spins.load(Ordering::Relaxed)
    }

    /// Iterate HOT pages of `section` with `filter` applied, used by
    /// journal-migration export (spec.md §4.9). Collects handles under the
    /// relevant partitions' read locks; callers re-acquire as needed.
    pub(crate) fn hot_pages_of_section<F>(&self, section: u64, mut filter: F) -> Vec<PageHandle>
    where
        F: FnMut(&Page) -> bool,
    {
        let mut out = Vec::new();
        for slot in &self.partitions {
            let guard = slot.lock.read();
            if let Some(metric_map) = guard.get(&section) {
                for start_map in metric_map.values() {
                    for page in start_map.values() {
                        if page.is_state(PageState::Hot) && filter(page) {
                            out.push(page.clone());
                        }
                    }
                }
            }
        }
        out
    }
}

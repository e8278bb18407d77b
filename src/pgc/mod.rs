//! The concurrent page cache (spec.md, full document). `Cache` is the
//! single entry point; `page`, `index`, `queues`, `pressure`, `eviction`,
//! `flush`, and `journal` are its internal collaborators, each grounded on
//! a distinct piece of the host's buffer-management stack (see module docs
//! and DESIGN.md).

pub mod eviction;
pub mod flush;
pub mod index;
pub mod journal;
pub mod page;
pub mod pressure;
pub mod queues;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::error::{PgcError, Result};
pub use crate::pgc::index::SearchMethod;
pub use crate::pgc::journal::{JournalExtent, JournalIndexes, MetricJournalEntry};
pub use crate::pgc::page::{PageEntryDescriptor, PageHandle};
use crate::pgc::page::PageState;
use crate::pgc::pressure::{PressureController, PressureLevel};
use crate::pgc::queues::{CleanQueue, SectionedQueue};

/// Aggregate statistics snapshot (spec.md §4.6, §6), including the
/// source's named event counters (`events_cache_under_severe_pressure`,
/// `events_cache_needs_space_aggressively`, `events_flush_critical`) and
/// CAS contention totals.
#[derive(Debug, Clone)]
pub struct CacheStatistics {
    pub hot_entries: usize,
    pub hot_size: usize,
    pub dirty_entries: usize,
    pub dirty_size: usize,
    pub clean_entries: usize,
    pub clean_size: usize,
    pub current_size: usize,
    pub wanted_size: usize,
    pub per_mille: u32,
    pub search_hits: usize,
    pub search_misses: usize,
    pub severe_pressure_events: u64,
    pub aggressive_evict_events: u64,
    pub flush_critical_events: u64,
    pub cas_spins: usize,
}

/// The cache. Cheaply cloneable (an `Arc` internally) so producers,
/// readers, and the background evictor/flusher can each hold a handle.
pub struct Cache {
    config: CacheConfig,
    index: index::Index,
    hot: SectionedQueue,
    dirty: SectionedQueue,
    clean: CleanQueue,
    pressure: PressureController,
    /// DIRTY-queue version last observed by a flush call, gating redundant
    /// scans (spec.md §4.2, §4.8 step 2).
    dirty_scan_version: std::sync::atomic::AtomicU64,
    /// Sections currently being exported by `open_cache_to_journal_v2`
    /// (spec.md §4.9's per-section single-migrator enforcement).
    migrating_sections: Mutex<HashSet<u64>>,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        let pressure = PressureController::new(config.clean_size_floor, config.pressure_thresholds);
        Arc::new(Self {
            index: index::Index::new(config.partitions),
            hot: SectionedQueue::new(),
            dirty: SectionedQueue::new(),
            clean: CleanQueue::new(),
            pressure,
            dirty_scan_version: std::sync::atomic::AtomicU64::new(0),
            migrating_sections: Mutex::new(HashSet::new()),
            config,
        })
    }

    fn autoscale_enabled(&self) -> bool {
        self.config.options.contains(crate::config::CacheOptions::AUTOSCALE)
    }

    fn evict_inline_enabled(&self) -> bool {
        self.config.options.contains(crate::config::CacheOptions::EVICT_PAGES_INLINE)
    }

    fn flush_inline_enabled(&self) -> bool {
        self.config.options.contains(crate::config::CacheOptions::FLUSH_PAGES_INLINE)
    }

    /// Insert a new page (HOT or CLEAN per `desc.hot`), or acquire a
    /// reference to the existing page at that key (spec.md §4.1 insert
    /// contract, §3 lifecycle). When `EVICT_PAGES_INLINE` is set and
    /// pressure is at least `AggressiveEvict`, runs an inline eviction pass
    /// before returning.
    pub fn add_and_acquire(&self, desc: PageEntryDescriptor) -> PageHandle {
        let size = desc.size;
        let hot = desc.hot;
        let outcome = self.index.insert(&desc);
        let page = match outcome {
            index::InsertOutcome::Added(page) => {
                self.pressure.add_current(size as i64);
                self.pressure.add_referenced(size as i64);
                if hot {
                    self.hot.add(&page);
                } else {
                    self.clean.add(&page, false);
                }
                trace!(section = desc.section, start_time = desc.start_time, "page added");
                page
            }
            index::InsertOutcome::Existing(page) => {
                self.pressure.add_referenced(0);
                page
            }
        };

        self.recompute_wanted();
        if self.evict_inline_enabled() {
            self.maybe_evict_inline();
        }
        page
    }

    /// Temporal search (spec.md §4.5, §6). Returns an acquired handle.
    pub fn find(&self, section: u64, metric_id: u64, t: i64, method: SearchMethod) -> Option<PageHandle> {
        let page = self.index.find(section, metric_id, t, method)?;
        if !page.ignore_accesses() {
            if page.is_state(PageState::Clean) {
                self.clean.move_to_tail_or_flag(&page);
            }
        }
        Some(page)
    }

    /// Acquire an additional reference to an already-held page (spec.md
    /// §4.3). Fails (returns `None`) if the page is being deleted.
    pub fn acquire(&self, page: &PageHandle) -> Option<PageHandle> {
        let outcome = page.acquire();
        if outcome.acquired {
            if outcome.became_referenced {
                self.pressure.add_referenced(page.assumed_size as i64);
            }
            Some(page.clone())
        } else {
            None
        }
    }

    /// Release a reference acquired via `add_and_acquire`/`find`/`acquire`
    /// (spec.md §4.3).
    pub fn release(&self, page: PageHandle) {
        let dropped_to_zero = page.release();
        if dropped_to_zero {
            self.pressure.add_referenced(-(page.assumed_size as i64));
        }
    }

    /// HOT -> DIRTY transition plus release of the caller's reference in
    /// one call, matching the common producer pattern (spec.md §4.4
    /// `set_dirty`). When `FLUSH_PAGES_INLINE` is set, may flush inline
    /// before returning.
    pub fn hot_to_dirty_and_release(&self, page: PageHandle) {
        self.set_dirty(&page);
        self.release(page);
        if self.flush_inline_enabled() {
            self.maybe_flush_inline();
        }
    }

    /// HOT -> DIRTY transition without releasing the caller's reference
    /// (spec.md §4.4). Takes the HOT queue lock *before* the page's
    /// transition lock, matching the order the "mass hot->dirty" path
    /// (journal migration) must also follow to avoid deadlock (spec.md
    /// §4.4/§5).
    pub fn set_dirty(&self, page: &PageHandle) {
        let mut hot_guard = self.hot.lock_sections();
        let _transition = page.transition_lock.lock();
        assert!(
            page.is_state(PageState::Hot),
            "invariant violated: set_dirty called on a non-HOT page"
        );
        self.hot.remove_locked(&mut hot_guard, page);
        drop(hot_guard);
        page.set_state(PageState::Dirty);
        self.dirty.add(page);
        self.dirty.bump_version();
    }

    /// Force a page HOT (used when a producer resumes writing to a page
    /// that had already gone CLEAN -- spec.md §3 lifecycle allows only
    /// producer-created pages to become HOT, so this asserts the page was
    /// never DIRTY).
    pub fn set_hot(&self, page: &PageHandle) {
        let _transition = page.transition_lock.lock();
        assert!(
            !page.is_state(PageState::Dirty),
            "invariant violated: set_hot called on a DIRTY page"
        );
        if page.is_state(PageState::Clean) {
            self.clean.remove(page);
        }
        page.set_state(PageState::Hot);
        self.hot.add(page);
    }

    /// DIRTY -> CLEAN transition (spec.md §4.4 `set_clean`), used directly
    /// by tests and by the flusher.
    pub fn set_clean(&self, page: &PageHandle) {
        let _transition = page.transition_lock.lock();
        assert!(
            page.is_state(PageState::Dirty),
            "invariant violated: set_clean called on a non-DIRTY page"
        );
        self.dirty.remove(page);
        page.set_state(PageState::Clean);
        self.clean.add(page, false);
    }

    /// DIRTY -> CLEAN, then immediately attempt eviction if the page has
    /// no other references (spec.md §4.4 `make_clean_and_try_evict`).
    /// Returns true if the page was evicted.
    pub fn make_clean_and_try_evict(&self, page: PageHandle) -> bool {
        self.set_clean(&page);
        let released_to_zero = page.release();
        if released_to_zero {
            self.pressure.add_referenced(-(page.assumed_size as i64));
            eviction::try_evict_single(&page, &self.clean, &self.index, &self.pressure, &self.config.free_clean_cb)
        } else {
            false
        }
    }

    /// Recompute `wanted_size` from `hot_size`/`dirty_size`, the floor,
    /// referenced size, and (if `AUTOSCALE` is set) `dynamic_target_size_cb`
    /// (spec.md §4.6).
    pub fn recompute_wanted(&self) -> usize {
        let cb: Option<&dyn Fn() -> usize> = match &self.config.dynamic_target_size_cb {
            Some(boxed) => Some(boxed.as_ref()),
            None => None,
        };
        self.pressure.recompute_wanted(
            self.hot.totals.size(),
            self.dirty.totals.size(),
            cb,
            self.autoscale_enabled(),
        )
    }

    /// Shrink the `hot_max` high-water mark the `AUTOSCALE` formula pins
    /// `wanted` to, so a subsequent `recompute_wanted`/`evict_pages` can
    /// shrink the cache back down (spec.md §8 scenario 6).
    pub fn reset_hot_max(&self) {
        self.pressure.reset_hot_max();
    }

    fn maybe_evict_inline(&self) {
        let usage = self.pressure.usage();
        if !matches!(usage.level, PressureLevel::AggressiveEvict | PressureLevel::Severe) {
            return;
        }
        let target = usage.current_size.saturating_sub(usage.wanted_size);
        if target == 0 {
            return;
        }
        let report = eviction::evict_pages(
            &self.clean,
            &self.index,
            &self.pressure,
            &self.config.free_clean_cb,
            target,
            self.config.max_pages_per_inline_eviction,
            self.config.max_skip_pages_per_inline_eviction,
        );
        if report.evicted > 0 {
            debug!(evicted = report.evicted, reclaimed = report.reclaimed_bytes, "inline eviction");
        }
    }

    fn maybe_flush_inline(&self) {
        for _ in 0..self.config.max_flushes_inline {
            match flush::flush_pages(
                &self.dirty,
                &self.clean,
                &self.index,
                &self.pressure,
                self.config.save_init_cb.as_ref(),
                &self.config.save_dirty_cb,
                self.config.max_dirty_pages_per_flush,
                flush::FlushTarget::All,
                false,
                false,
                &self.dirty_scan_version,
            ) {
                Ok(report) if report.pages_flushed > 0 => continue,
                Ok(_) => break,
                Err(err) => {
                    // Callback failures are the caller's responsibility
                    // (spec.md §7); this layer only logs, it does not track
                    // a counter for them (`flush_critical` is a pressure
                    // condition, tracked in `PressureController`).
                    debug!(error = %err, "inline flush failed, leaving pages dirty");
                    break;
                }
            }
        }
    }

    /// Explicit (non-inline) flush pass, for callers running their own
    /// background flusher loop instead of relying on `FLUSH_PAGES_INLINE`
    /// (spec.md §4.8 `flush_pages(max_flushes, section, wait, all)`).
    pub fn flush_pages(
        &self,
        max_dirty_pages_per_call: usize,
        target: flush::FlushTarget,
        wait: bool,
        all: bool,
    ) -> Result<flush::FlushReport> {
        flush::flush_pages(
            &self.dirty,
            &self.clean,
            &self.index,
            &self.pressure,
            self.config.save_init_cb.as_ref(),
            &self.config.save_dirty_cb,
            max_dirty_pages_per_call,
            target,
            wait,
            all,
            &self.dirty_scan_version,
        )
    }

    /// Explicit (non-inline) eviction pass, for callers running their own
    /// background evictor loop instead of relying on `EVICT_PAGES_INLINE`.
    /// Unlike the inline path, this is not bounded by
    /// `max_pages_per_inline_eviction`/`max_skip_pages_per_inline_eviction`
    /// -- those exist specifically to cap latency on a producer's hot
    /// path, which does not apply to an out-of-band call.
    pub fn evict_pages(&self, target_bytes: usize) -> eviction::EvictionReport {
        eviction::evict_pages(
            &self.clean,
            &self.index,
            &self.pressure,
            &self.config.free_clean_cb,
            target_bytes,
            usize::MAX,
            usize::MAX,
        )
    }

    /// Filtered eviction pass (spec.md §4.7, §9 open question on batching:
    /// the filter runs page-by-page under the CLEAN lock here, matching
    /// the source; see DESIGN.md). Unbounded like [`Cache::evict_pages`].
    pub fn evict_pages_with_filter<F>(&self, target_bytes: usize, filter: F) -> eviction::EvictionReport
    where
        F: FnMut(&page::Page) -> bool,
    {
        eviction::evict_pages_with_filter(
            &self.clean,
            &self.index,
            &self.pressure,
            &self.config.free_clean_cb,
            target_bytes,
            usize::MAX,
            usize::MAX,
            filter,
        )
    }

    /// Journal-migration export (spec.md §4.9): export every HOT page of
    /// `section` tagged with `datafile_id`, hand the rebuilt indexes to
    /// `callback`, then transition the exported pages to DIRTY.
    pub fn open_cache_to_journal_v2<F>(&self, section: u64, datafile_id: u32, callback: F) -> Result<()>
    where
        F: FnOnce(JournalIndexes),
    {
        journal::open_cache_to_journal_v2(&self.hot, &self.dirty, &self.migrating_sections, section, datafile_id, callback)
    }

    pub fn statistics(&self) -> CacheStatistics {
        let usage = self.pressure.usage();
        let (hits, misses) = self.index.search_stats();
        CacheStatistics {
            hot_entries: self.hot.totals.entries(),
            hot_size: self.hot.totals.size(),
            dirty_entries: self.dirty.totals.entries(),
            dirty_size: self.dirty.totals.size(),
            clean_entries: self.clean.totals.entries(),
            clean_size: self.clean.totals.size(),
            current_size: usage.current_size,
            wanted_size: usage.wanted_size,
            per_mille: usage.per_mille,
            search_hits: hits,
            search_misses: misses,
            severe_pressure_events: self.pressure.severe_events(),
            aggressive_evict_events: self.pressure.aggressive_events(),
            flush_critical_events: self.pressure.flush_critical_events(),
            cas_spins: self.index.cas_spins(),
        }
    }

    /// Tear down the cache: an explicit, ordered teardown rather than a
    /// no-op (spec.md §9's MRG no-op gap does not extend to the cache
    /// itself; see DESIGN.md). Refuses to run while DIRTY pages remain
    /// unflushed, then frees every HOT and CLEAN page via `free_clean_cb`,
    /// draining all three queues. Pages still referenced by callers
    /// outside the cache remain alive (the `Arc<Page>` they hold) until
    /// those callers drop their own handles too.
    pub fn destroy(self: Arc<Self>) -> Result<()> {
        if self.dirty.totals.entries() > 0 {
            return Err(PgcError::InvalidConfig(
                "cannot destroy a cache with unflushed DIRTY pages".into(),
            ));
        }

        for section in self.hot.sections_present() {
            for page in self.hot.section_snapshot(section) {
                self.hot.remove(&page);
                (self.config.free_clean_cb)(page.descriptor());
            }
        }
        loop {
            let page = self.clean.lock().pop_front();
            match page {
                Some(page) => (self.config.free_clean_cb)(page.descriptor()),
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn test_cache() -> StdArc<Cache> {
        let free_cb = Box::new(|_| {});
        let save_cb = Box::new(|_, _: &[PageEntryDescriptor]| Ok(()));
        let config = CacheConfig::builder()
            .partitions(2)
            .clean_size_floor(1)
            .free_clean_cb(free_cb)
            .save_dirty_cb(save_cb)
            .build()
            .unwrap();
        Cache::new(config)
    }

    fn desc(section: u64, start: i64, hot: bool) -> PageEntryDescriptor {
        PageEntryDescriptor {
            section,
            metric_id: 1,
            start_time: start,
            end_time: start + 10,
            update_every: 1,
            size: 64,
            data: Arc::from(vec![0u8; 8]),
            custom_data: None,
            hot,
        }
    }

    #[test]
    fn single_add_release_evict() {
        let cache = test_cache();
        let page = cache.add_and_acquire(desc(1, 0, false));
        assert_eq!(page.refcount(), 1);
        cache.release(page.clone());
        assert_eq!(page.refcount(), 0);
        let report = cache.evict_pages(usize::MAX);
        assert_eq!(report.evicted, 1);
    }

    #[test]
    fn duplicate_add_shares_page() {
        let cache = test_cache();
        let a = cache.add_and_acquire(desc(2, 0, false));
        let b = cache.add_and_acquire(desc(2, 0, false));
        assert!(StdArc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 2);
    }

    #[test]
    fn hot_dirty_clean_roundtrip() {
        let cache = test_cache();
        let page = cache.add_and_acquire(desc(3, 0, true));
        assert!(page.is_state(PageState::Hot));
        cache.set_dirty(&page);
        assert!(page.is_state(PageState::Dirty));
        cache.set_clean(&page);
        assert!(page.is_state(PageState::Clean));
        cache.release(page);
    }

    #[test]
    fn closest_search_through_cache() {
        let cache = test_cache();
        cache.release(cache.add_and_acquire(desc(4, 100, false)));
        cache.release(cache.add_and_acquire(desc(4, 300, false)));
        let hit = cache.find(4, 1, 250, SearchMethod::Closest).unwrap();
        assert_eq!(hit.key().start_time, 300);
        cache.release(hit);
    }

    #[test]
    fn eviction_respects_refcount_at_scale() {
        let cache = test_cache();
        let mut held = Vec::new();
        for i in 0..1000 {
            let page = cache.add_and_acquire(desc(5, i, false));
            if i % 10 == 0 {
                held.push(page);
            } else {
                cache.release(page);
            }
        }
        let report = cache.evict_pages(usize::MAX);
        assert_eq!(report.evicted, 900);
        assert_eq!(cache.statistics().clean_entries, 100);
        for page in held {
            cache.release(page);
        }
    }

    #[test]
    fn pressure_pipeline_triggers_inline_eviction() {
        // clean_size_floor is clamped up to a 1 MiB minimum (see
        // MIN_CLEAN_SIZE_FLOOR in config.rs), so pages large enough to
        // cross that floor are needed to actually reach AggressiveEvict.
        fn big_desc(section: u64, start: i64) -> PageEntryDescriptor {
            PageEntryDescriptor {
                section,
                metric_id: 1,
                start_time: start,
                end_time: start + 10,
                update_every: 1,
                size: 8192,
                data: Arc::from(vec![0u8; 8192]),
                custom_data: None,
                hot: false,
            }
        }

        let free_cb = Box::new(|_| {});
        let save_cb = Box::new(|_, _: &[PageEntryDescriptor]| Ok(()));
        let config = CacheConfig::builder()
            .partitions(1)
            .clean_size_floor(1024)
            .max_pages_per_inline_eviction(1000)
            .max_skip_pages_per_inline_eviction(1000)
            .free_clean_cb(free_cb)
            .save_dirty_cb(save_cb)
            .build()
            .unwrap();
        let cache = Cache::new(config);
        for i in 0..200 {
            let page = cache.add_and_acquire(big_desc(6, i));
            cache.release(page);
        }
        let stats = cache.statistics();
        assert!(stats.clean_entries < 200, "inline eviction should have reclaimed some pages");
        assert!(stats.current_size <= stats.wanted_size + 8192);
    }

    #[test]
    fn autoscale_pressure_pipeline_scenario() {
        // spec.md §8 scenario 6: wanted doubles once hot_size exceeds
        // hot_max, flush_critical fires while dirty_size exceeds hot_max,
        // and reset_hot_max + evict_pages lets the cache shrink back down.
        let free_cb = Box::new(|_| {});
        let save_cb = Box::new(|_, _: &[PageEntryDescriptor]| Ok(()));
        let config = CacheConfig::builder()
            .partitions(1)
            .clean_size_floor(1024)
            .options(crate::config::CacheOptions::AUTOSCALE)
            .free_clean_cb(free_cb)
            .save_dirty_cb(save_cb)
            .build()
            .unwrap();
        let cache = Cache::new(config);

        let mut hot_pages = Vec::new();
        for i in 0..50 {
            let page = cache.add_and_acquire(desc(10, i, true));
            hot_pages.push(page);
        }
        let wanted_after_hot = cache.statistics().wanted_size;
        assert!(wanted_after_hot >= 2 * cache.statistics().hot_size, "wanted should double relative to hot_size");

        // Mass hot -> dirty, driving dirty_size above the hot_max just
        // recorded, which should trip flush_critical on the next
        // recompute.
        for page in &hot_pages {
            cache.set_dirty(page);
        }
        cache.recompute_wanted();
        assert!(cache.statistics().flush_critical_events >= 1);

        for page in hot_pages {
            cache.release(page);
        }
        cache.flush_pages(50, flush::FlushTarget::All, true, true).unwrap();

        cache.reset_hot_max();
        cache.evict_pages(usize::MAX);
        cache.recompute_wanted();
        let wanted_after_reset = cache.statistics().wanted_size;
        assert!(
            wanted_after_reset < wanted_after_hot,
            "reset_hot_max + evict_pages should shrink the cache back toward the floor"
        );
    }

    #[test]
    fn destroy_frees_hot_and_clean_pages_but_refuses_with_dirty() {
        let freed = StdArc::new(AtomicUsize::new(0));
        let freed2 = freed.clone();
        let config = CacheConfig::builder()
            .partitions(2)
            .clean_size_floor(1)
            .free_clean_cb(Box::new(move |_| {
                freed2.fetch_add(1, Ordering::Relaxed);
            }))
            .save_dirty_cb(Box::new(|_, _: &[PageEntryDescriptor]| Ok(())))
            .build()
            .unwrap();
        let cache = Cache::new(config);

        let hot = cache.add_and_acquire(desc(1, 0, true));
        cache.release(hot);
        let clean = cache.add_and_acquire(desc(2, 0, false));
        cache.release(clean);
        let dirty = cache.add_and_acquire(desc(3, 0, true));
        cache.set_dirty(&dirty);
        cache.release(dirty);

        assert!(cache.clone().destroy().is_err());

        cache.flush_pages(10, flush::FlushTarget::All, true, true).unwrap();
        cache.destroy().unwrap();
        assert_eq!(freed.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn make_clean_and_try_evict_frees_unreferenced_page() {
        let cache = test_cache();
        let freed = StdArc::new(AtomicUsize::new(0));
        let freed2 = freed.clone();
        let config = CacheConfig::builder()
            .partitions(1)
            .clean_size_floor(1)
            .free_clean_cb(Box::new(move |_| {
                freed2.fetch_add(1, Ordering::Relaxed);
            }))
            .save_dirty_cb(Box::new(|_, _: &[PageEntryDescriptor]| Ok(())))
            .build()
            .unwrap();
        let cache2 = Cache::new(config);
        let page = cache2.add_and_acquire(desc(1, 0, true));
        cache2.set_dirty(&page);
        let evicted = cache2.make_clean_and_try_evict(page);
        assert!(evicted);
        assert_eq!(freed.load(Ordering::Relaxed), 1);
        let _ = cache;
    }
}

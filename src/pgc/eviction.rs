//! Eviction (spec.md §4.7), grounded on the host's eviction policy drivers
//! in `src/buffer/eviction.rs`: scan from the head of the CLEAN queue,
//! respect the deferred-access flag, respect refcount, stop once enough
//! bytes are reclaimed or the scan budget is exhausted.

use std::sync::Arc;

use crate::config::FreeCleanCb;
use crate::pgc::index::Index;
use crate::pgc::page::{Page, PageFlags, PageState};
use crate::pgc::pressure::PressureController;
use crate::pgc::queues::CleanQueue;

pub struct EvictionReport {
    pub scanned: usize,
    pub evicted: usize,
    pub reclaimed_bytes: usize,
    pub skipped_referenced: usize,
    pub skipped_reaccessed: usize,
}

/// Evict from the head of `clean` until `target_bytes` have been reclaimed
/// or `max_pages`/`max_skip` budgets are exhausted (spec.md §4.7, §6
/// `max_pages_per_inline_eviction` / `max_skip_pages_per_inline_eviction`).
pub(crate) fn evict_pages(
    clean: &CleanQueue,
    index: &Index,
    pressure: &PressureController,
    free_clean_cb: &FreeCleanCb,
    target_bytes: usize,
    max_pages: usize,
    max_skip: usize,
) -> EvictionReport {
    evict_pages_with_filter(
        clean,
        index,
        pressure,
        free_clean_cb,
        target_bytes,
        max_pages,
        max_skip,
        |_| true,
    )
}

/// As [`evict_pages`], but a page is only considered a candidate when
/// `filter` returns true; pages rejected by the filter are put back at the
/// tail rather than counted against `max_skip` (spec.md §4.7 note on
/// filtered eviction, e.g. "evict everything except section X").
pub(crate) fn evict_pages_with_filter<F>(
    clean: &CleanQueue,
    index: &Index,
    pressure: &PressureController,
    free_clean_cb: &FreeCleanCb,
    target_bytes: usize,
    max_pages: usize,
    max_skip: usize,
    mut filter: F,
) -> EvictionReport
where
    F: FnMut(&Page) -> bool,
{
    let mut report = EvictionReport {
        scanned: 0,
        evicted: 0,
        reclaimed_bytes: 0,
        skipped_referenced: 0,
        skipped_reaccessed: 0,
    };
    let mut to_remove_from_index = Vec::new();
    let mut rejected_by_filter = Vec::new();
    let mut skips = 0usize;

    {
        let mut guard = clean.lock();
        while report.reclaimed_bytes < target_bytes
            && report.evicted < max_pages
            && skips < max_skip
        {
            let Some(candidate) = guard.pop_front() else {
                break;
            };
            report.scanned += 1;

            if !filter(&candidate) {
                rejected_by_filter.push(candidate);
                continue;
            }

            // Deferred access: a non-blocking `move_to_tail` could not
            // acquire the lock earlier and left this flag instead. Honor
            // it now that we hold the lock, by re-queuing at the tail.
            if candidate.has_flag(PageFlags::HAS_BEEN_ACCESSED) {
                candidate.clear_flag(PageFlags::HAS_BEEN_ACCESSED);
                guard.push_back(candidate);
                report.skipped_reaccessed += 1;
                skips += 1;
                continue;
            }

            let _transition = candidate.transition_lock.lock();
            if !candidate.reserve_for_deletion_from(0) {
                // Someone acquired it between pop and lock; it is no
                // longer evictable this pass. Put it back and move on.
                drop(_transition);
                guard.push_back(candidate);
                report.skipped_referenced += 1;
                skips += 1;
                continue;
            }

            report.reclaimed_bytes += candidate.assumed_size;
            report.evicted += 1;
            clean.totals.size.fetch_sub(
                candidate.assumed_size,
                std::sync::atomic::Ordering::Relaxed,
            );
            clean.totals.entries.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            to_remove_from_index.push(candidate);
        }

        for p in rejected_by_filter {
            guard.push_back(p);
        }
    }

    if !to_remove_from_index.is_empty() {
        index.remove_batch(&to_remove_from_index);
        for page in &to_remove_from_index {
            pressure.add_current(-(page.assumed_size as i64));
            free_clean_cb(page.descriptor());
        }
    }

    report
}

/// True once a single page's worth of CLEAN entries would suffice to bring
/// usage back under `evict_low`, used by callers deciding whether an
/// inline eviction pass is still worth attempting (spec.md §4.7).
pub(crate) fn should_keep_evicting(pressure: &PressureController) -> bool {
    let usage = pressure.usage();
    usage.per_mille > pressure.thresholds().evict_low
}

/// Promote a page that just transitioned CLEAN -> (about to be removed) so
/// callers share one code path for "evict this one specific page now",
/// used by `make_clean_and_try_evict` (spec.md §4.4).
pub(crate) fn try_evict_single(
    page: &Arc<Page>,
    clean: &CleanQueue,
    index: &Index,
    pressure: &PressureController,
    free_clean_cb: &FreeCleanCb,
) -> bool {
    debug_assert!(page.is_state(PageState::Clean));
    if !page.reserve_for_deletion_from(0) {
        return false;
    }
    clean.remove(page);
    index.remove(page);
    pressure.add_current(-(page.assumed_size as i64));
    free_clean_cb(page.descriptor());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PressureThresholds;
    use crate::pgc::index::{Index, InsertOutcome, SearchMethod};
    use crate::pgc::page::PageEntryDescriptor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn desc(start: i64) -> PageEntryDescriptor {
        PageEntryDescriptor {
            section: 1,
            metric_id: 1,
            start_time: start,
            end_time: start + 10,
            update_every: 1,
            size: 100,
            data: Arc::from(vec![0u8; 8]),
            custom_data: None,
            hot: false,
        }
    }

    #[test]
    fn evicts_until_target_reached_and_respects_refcount() {
        let index = Index::new(2);
        let clean = CleanQueue::new();
        let pressure = PressureController::new(1, PressureThresholds::default());
        let freed = Arc::new(AtomicUsize::new(0));
        let freed2 = freed.clone();
        let free_cb: FreeCleanCb = Box::new(move |_| {
            freed2.fetch_add(1, Ordering::Relaxed);
        });

        let mut held = None;
        for i in 0..5 {
            let d = desc(i);
            let page = match index.insert(&d) {
                InsertOutcome::Added(p) => p,
                InsertOutcome::Existing(p) => p,
            };
            pressure.add_current(page.assumed_size as i64);
            page.release(); // release the insert()-acquired ref
            if i == 2 {
                // keep one page referenced so eviction must skip it
                page.acquire();
                held = Some(page.clone());
            }
            clean.add(&page, false);
        }

        let report = evict_pages(&clean, &index, &pressure, &free_cb, 1000, 10, 10);
        assert_eq!(report.evicted, 4);
        assert_eq!(report.skipped_referenced, 1);
        assert_eq!(freed.load(Ordering::Relaxed), 4);
        assert!(index.find(1, 1, 2, SearchMethod::Exact).is_some());
        drop(held);
    }
}

//! Flushing DIRTY pages to durable storage via the caller's `save_dirty_cb`
//! (spec.md §4.8), grounded on the host's write-back path in
//! `src/memory/buffer_pool.rs` (`flush_dirty_frames`): snapshot the DIRTY
//! queue once, batch by section, invoke the callback once per batch, only
//! then transition pages to CLEAN.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{SaveDirtyCb, SaveInitCb};
use crate::error::Result;
use crate::pgc::index::Index;
use crate::pgc::page::{PageHandle, PageState};
use crate::pgc::pressure::PressureController;
use crate::pgc::queues::{CleanQueue, SectionedQueue};

pub struct FlushReport {
    pub sections_flushed: usize,
    pub pages_flushed: usize,
    pub bytes_flushed: usize,
}

/// Which section(s) a flush call targets (spec.md §4.8 `flush_pages`
/// signature: `section` is either one specific section or the
/// `PGC_SECTION_ALL` sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    Section(u64),
    All,
}

/// Flush up to `max_dirty_pages_per_call` pages per candidate section
/// (spec.md §4.8). Steps, matching the spec's numbering:
///
/// 1. Try (or, if `wait`, block on) the DIRTY queue's section-map lock;
///    give up entirely (returning an empty report) if `wait` is false and
///    it's contended.
/// 2. Skip the whole call if the DIRTY version counter hasn't moved since
///    the last call and `all` is not set -- nothing new to flush.
/// 3. Per section: skip it (unless `all`) if it has fewer than
///    `max_dirty_pages_per_call` entries; try each page's transition lock
///    non-blockingly, releasing and skipping pages that are contended.
/// 4. If the resulting batch didn't reach `max_dirty_pages_per_call` and
///    `all` is not set, release every acquired reference/lock and move on
///    without calling back.
/// 5. Otherwise invoke `save_init_cb`/`save_dirty_cb` and, on success,
///    transition the batch DIRTY -> CLEAN.
#[allow(clippy::too_many_arguments)]
pub(crate) fn flush_pages(
    dirty: &SectionedQueue,
    clean: &CleanQueue,
    index: &Index,
    pressure: &PressureController,
    save_init_cb: Option<&SaveInitCb>,
    save_dirty_cb: &SaveDirtyCb,
    max_dirty_pages_per_call: usize,
    target: FlushTarget,
    wait: bool,
    all: bool,
    last_seen_version: &AtomicU64,
) -> Result<FlushReport> {
    let _ = index;
    let _ = pressure;
    let mut report = FlushReport {
        sections_flushed: 0,
        pages_flushed: 0,
        bytes_flushed: 0,
    };

    let version = dirty.version();
    if !all && version == last_seen_version.load(Ordering::Acquire) {
        return Ok(report);
    }

    let Some(sections_snapshot) = dirty.snapshot_sections(wait) else {
        return Ok(report);
    };
    last_seen_version.store(version, Ordering::Release);

    let candidate_sections: Vec<u64> = match target {
        FlushTarget::All => sections_snapshot.keys().copied().collect(),
        FlushTarget::Section(s) => {
            if sections_snapshot.contains_key(&s) {
                vec![s]
            } else {
                Vec::new()
            }
        }
    };

    for section in candidate_sections {
        let Some(pages) = sections_snapshot.get(&section).filter(|p| !p.is_empty()) else {
            continue;
        };
        if pages.len() < max_dirty_pages_per_call && !all {
            continue;
        }

        let candidates: Vec<PageHandle> = pages.iter().take(max_dirty_pages_per_call).cloned().collect();
        let mut batch: Vec<PageHandle> = Vec::with_capacity(candidates.len());
        let mut guards: Vec<parking_lot::MutexGuard<'_, ()>> = Vec::with_capacity(candidates.len());
        for page in &candidates {
            let outcome = page.acquire();
            if !outcome.acquired {
                continue;
            }
            match page.transition_lock.try_lock() {
                Some(guard) => {
                    guards.push(guard);
                    batch.push(page.clone());
                }
                None => page.release(),
            }
        }

        if batch.len() < max_dirty_pages_per_call && !all {
            for page in &batch {
                page.release();
            }
            drop(guards);
            continue;
        }

        let init_result = match save_init_cb {
            Some(init) => init(section),
            None => Ok(()),
        };
        if let Err(err) = init_result {
            for page in &batch {
                page.release();
            }
            return Err(err);
        }

        let descriptors: Vec<_> = batch.iter().map(|p| p.descriptor()).collect();
        match save_dirty_cb(section, &descriptors) {
            Ok(()) => {
                for page in &batch {
                    dirty.remove(page);
                    page.set_state(PageState::Clean);
                    clean.add(page, false);
                    report.bytes_flushed += page.assumed_size;
                }
                report.pages_flushed += batch.len();
                report.sections_flushed += 1;
                for page in &batch {
                    page.release();
                }
            }
            Err(err) => {
                for page in &batch {
                    page.release();
                }
                return Err(err);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgc::index::{Index, InsertOutcome};
    use crate::pgc::page::PageEntryDescriptor;
    use crate::config::PressureThresholds;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn desc(section: u64, start: i64) -> PageEntryDescriptor {
        PageEntryDescriptor {
            section,
            metric_id: 1,
            start_time: start,
            end_time: start + 10,
            update_every: 1,
            size: 64,
            data: Arc::from(vec![0u8; 8]),
            custom_data: None,
            hot: true,
        }
    }

    #[test]
    fn flush_moves_dirty_to_clean_and_calls_back() {
        let index = Index::new(2);
        let dirty = SectionedQueue::new();
        let clean = CleanQueue::new();
        let pressure = PressureController::new(1, PressureThresholds::default());
        let version = AtomicU64::new(0);

        let mut pages = Vec::new();
        for i in 0..3 {
            let d = desc(1, i);
            let page = match index.insert(&d) {
                InsertOutcome::Added(p) => p,
                InsertOutcome::Existing(p) => p,
            };
            dirty.add(&page);
            dirty.bump_version();
            pages.push(page);
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let save_cb: SaveDirtyCb = Box::new(move |_section, descs| {
            calls2.fetch_add(descs.len(), Ordering::Relaxed);
            Ok(())
        });

        let report = flush_pages(
            &dirty, &clean, &index, &pressure, None, &save_cb, 10, FlushTarget::All, true, true, &version,
        )
        .unwrap();
        assert_eq!(report.pages_flushed, 3);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(dirty.section_len(1), 0);
        assert_eq!(clean.lock().len(), 3);
    }

    #[test]
    fn flush_failure_leaves_pages_dirty() {
        let index = Index::new(2);
        let dirty = SectionedQueue::new();
        let clean = CleanQueue::new();
        let pressure = PressureController::new(1, PressureThresholds::default());
        let version = AtomicU64::new(0);

        let d = desc(2, 0);
        let page = match index.insert(&d) {
            InsertOutcome::Added(p) => p,
            InsertOutcome::Existing(p) => p,
        };
        dirty.add(&page);
        dirty.bump_version();

        let save_cb: SaveDirtyCb = Box::new(|_, _| Err(crate::error::PgcError::SaveFailed("disk full".into())));
        let result = flush_pages(
            &dirty, &clean, &index, &pressure, None, &save_cb, 10, FlushTarget::All, true, true, &version,
        );
        assert!(result.is_err());
        assert_eq!(dirty.section_len(2), 1);
        assert_eq!(clean.lock().len(), 0);
    }

    #[test]
    fn below_threshold_batch_is_skipped_unless_all() {
        let index = Index::new(2);
        let dirty = SectionedQueue::new();
        let clean = CleanQueue::new();
        let pressure = PressureController::new(1, PressureThresholds::default());
        let version = AtomicU64::new(0);

        let d = desc(3, 0);
        let page = match index.insert(&d) {
            InsertOutcome::Added(p) => p,
            InsertOutcome::Existing(p) => p,
        };
        dirty.add(&page);
        dirty.bump_version();

        let save_cb: SaveDirtyCb = Box::new(|_, _| Ok(()));
        let report = flush_pages(
            &dirty, &clean, &index, &pressure, None, &save_cb, 10, FlushTarget::All, true, false, &version,
        )
        .unwrap();
        assert_eq!(report.pages_flushed, 0);
        assert_eq!(dirty.section_len(3), 1);
    }

    #[test]
    fn unchanged_version_short_circuits_without_wait() {
        let index = Index::new(2);
        let dirty = SectionedQueue::new();
        let clean = CleanQueue::new();
        let pressure = PressureController::new(1, PressureThresholds::default());
        let version = AtomicU64::new(dirty.version());

        let save_cb: SaveDirtyCb = Box::new(|_, _| Ok(()));
        let report = flush_pages(
            &dirty, &clean, &index, &pressure, None, &save_cb, 10, FlushTarget::All, false, false, &version,
        )
        .unwrap();
        assert_eq!(report.pages_flushed, 0);
    }

    #[test]
    fn section_target_ignores_other_sections() {
        let index = Index::new(2);
        let dirty = SectionedQueue::new();
        let clean = CleanQueue::new();
        let pressure = PressureController::new(1, PressureThresholds::default());
        let version = AtomicU64::new(0);

        for section in [1u64, 2u64] {
            let d = desc(section, 0);
            let page = match index.insert(&d) {
                InsertOutcome::Added(p) => p,
                InsertOutcome::Existing(p) => p,
            };
            dirty.add(&page);
            dirty.bump_version();
        }

        let save_cb: SaveDirtyCb = Box::new(|_, _| Ok(()));
        let report = flush_pages(
            &dirty, &clean, &index, &pressure, None, &save_cb, 1, FlushTarget::Section(1), true, true, &version,
        )
        .unwrap();
        assert_eq!(report.pages_flushed, 1);
        assert_eq!(dirty.section_len(1), 0);
        assert_eq!(dirty.section_len(2), 1);
    }
}

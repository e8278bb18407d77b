//! HOT / DIRTY / CLEAN state queues (spec.md §4.2), grounded on the host's
//! per-tier frame lists in `src/memory/buffer_pool.rs`
//! (`hot_frames`/`warm_frames`/`cold_frames: Arc<Mutex<Vec<...>>>`), here
//! specialized into the three PGC states with spec-mandated ordering and
//! section grouping.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::pgc::page::{Page, PageFlags, PageHandle};

/// Aggregate accounting shared by all three queues.
#[derive(Default)]
pub(crate) struct QueueTotals {
    pub entries: AtomicUsize,
    pub size: AtomicUsize,
    pub additions: AtomicU64,
    pub removals: AtomicU64,
}

impl QueueTotals {
    fn on_add(&self, size: usize) {
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.size.fetch_add(size, Ordering::Relaxed);
        self.additions.fetch_add(1, Ordering::Relaxed);
    }

    fn on_remove(&self, size: usize) {
        self.entries.fetch_sub(1, Ordering::Relaxed);
        self.size.fetch_sub(size, Ordering::Relaxed);
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn entries(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub(crate) fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }
}

/// HOT and DIRTY share the same shape: pages linked per-section, in
/// insertion order within a section.
pub(crate) struct SectionedQueue {
    sections: Mutex<HashMap<u64, VecDeque<PageHandle>>>,
    pub totals: QueueTotals,
    /// DIRTY-only: bumped whenever a batch-sized fraction is appended, used
    /// by the flusher to suppress redundant scans (spec.md §4.2). Harmless
    /// on HOT, where it is simply unused.
    version: AtomicU64,
}

impl SectionedQueue {
    pub(crate) fn new() -> Self {
        Self {
            sections: Mutex::new(HashMap::new()),
            totals: QueueTotals::default(),
            version: AtomicU64::new(0),
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Append `page` to the tail of its section's list and update counters.
    /// Caller sets the page's state flag only *after* this returns (spec.md
    /// §4.2 ordering requirement).
    pub(crate) fn add(&self, page: &PageHandle) {
        let mut guard = self.sections.lock();
        guard.entry(page.key.section).or_default().push_back(page.clone());
        self.totals.on_add(page.assumed_size);
    }

    /// Remove `page` from its section's list. Caller clears the page's
    /// state flag only *after* this returns.
    pub(crate) fn remove(&self, page: &Page) {
        let mut guard = self.sections.lock();
        if let Some(list) = guard.get_mut(&page.key.section) {
            if let Some(pos) = list.iter().position(|p| std::ptr::eq(p.as_ref(), page)) {
                list.remove(pos);
                self.totals.on_remove(page.assumed_size);
            }
            if list.is_empty() {
                guard.remove(&page.key.section);
            }
        }
    }

    /// Snapshot of all pages in `section`, in insertion order. Used by
    /// flushing (DIRTY) and journal export (HOT).
    pub(crate) fn section_snapshot(&self, section: u64) -> Vec<PageHandle> {
        let guard = self.sections.lock();
        guard
            .get(&section)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn section_len(&self, section: u64) -> usize {
        let guard = self.sections.lock();
        guard.get(&section).map(VecDeque::len).unwrap_or(0)
    }

    /// All section keys currently present, used for "first-then-next"
    /// traversal (spec.md §4.8, §9).
    pub(crate) fn sections_present(&self) -> Vec<u64> {
        self.sections.lock().keys().copied().collect()
    }

    /// Snapshot every section's contents in one lock hold, for the
    /// flusher's per-call scan (spec.md §4.8 step 1: try the queue lock, or
    /// block if `wait`; give up entirely if `wait` is false and the lock is
    /// contended).
    pub(crate) fn snapshot_sections(&self, wait: bool) -> Option<HashMap<u64, Vec<PageHandle>>> {
        let guard = if wait {
            Some(self.sections.lock())
        } else {
            self.sections.try_lock()
        }?;
        Some(guard.iter().map(|(k, v)| (*k, v.iter().cloned().collect())).collect())
    }

    /// Lock the section map directly, for callers that must interleave it
    /// with a per-page transition lock in a specific order (spec.md §4.4's
    /// "HOT lock before transition lock" rule). See [`Self::remove_locked`].
    pub(crate) fn lock_sections(&self) -> MutexGuard<'_, HashMap<u64, VecDeque<PageHandle>>> {
        self.sections.lock()
    }

    /// Same as [`Self::remove`], but operating on a guard the caller already
    /// holds (see [`Self::lock_sections`]) instead of re-locking internally.
    pub(crate) fn remove_locked(&self, guard: &mut HashMap<u64, VecDeque<PageHandle>>, page: &Page) {
        if let Some(list) = guard.get_mut(&page.key.section) {
            if let Some(pos) = list.iter().position(|p| std::ptr::eq(p.as_ref(), page)) {
                list.remove(pos);
                self.totals.on_remove(page.assumed_size);
            }
            if list.is_empty() {
                guard.remove(&page.key.section);
            }
        }
    }
}

/// CLEAN: a single (non-sectioned) list with LRU-ish ordering (spec.md
/// §4.2).
pub(crate) struct CleanQueue {
    list: Mutex<VecDeque<PageHandle>>,
    pub totals: QueueTotals,
}

impl CleanQueue {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(VecDeque::new()),
            totals: QueueTotals::default(),
        }
    }

    /// New or recently-accessed pages are appended (tail = most recently
    /// used); never-accessed demoted pages are prepended (head = first
    /// eviction candidate).
    pub(crate) fn add(&self, page: &PageHandle, demoted_never_accessed: bool) {
        let mut guard = self.list.lock();
        if demoted_never_accessed {
            guard.push_front(page.clone());
        } else {
            guard.push_back(page.clone());
        }
        self.totals.on_add(page.assumed_size);
    }

    pub(crate) fn remove(&self, page: &Page) {
        let mut guard = self.list.lock();
        if let Some(pos) = guard.iter().position(|p| std::ptr::eq(p.as_ref(), page)) {
            guard.remove(pos);
            self.totals.on_remove(page.assumed_size);
        }
    }

    /// Move `page` to the tail (LRU update). Non-blocking: if the lock is
    /// contended, flags `has_been_accessed` instead of moving, to be
    /// resolved later by the evictor's scan (spec.md §4.2).
    pub(crate) fn move_to_tail_or_flag(&self, page: &PageHandle) {
        match self.list.try_lock() {
            Some(mut guard) => {
                if let Some(pos) = guard.iter().position(|p| std::ptr::eq(p.as_ref(), page.as_ref())) {
                    let removed = guard.remove(pos).expect("position just found");
                    guard.push_back(removed);
                }
            }
            None => page.set_flag(PageFlags::HAS_BEEN_ACCESSED),
        }
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, VecDeque<PageHandle>> {
        self.list.lock()
    }

    pub(crate) fn try_lock(&self) -> Option<parking_lot::MutexGuard<'_, VecDeque<PageHandle>>> {
        self.list.try_lock()
    }
}

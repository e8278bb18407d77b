//! The `Page` entity (spec.md §3) and its refcount protocol (§4.3).
//!
//! Modeled as an `Arc<Page>` handle rather than a raw pointer kept alive by
//! a refcount, per the Design Notes' "pointer graphs -> arenas + indices"
//! guidance: the `Arc` strong count is Rust's arena, the logical `refcount`
//! field below is the cache's own acquire/release protocol layered on top
//! of it. A page can be present in an index/queue (one `Arc` each) with a
//! logical refcount of zero; it is only actually deallocated when the last
//! `Arc` drops, which happens after `reserve_for_deletion` succeeds and the
//! page is unlinked everywhere.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Sentinel refcount value marking a page reserved for deletion. Chosen far
/// below any legal refcount so a stray `fetch_add` cannot wrap back into
/// positive territory before the page is freed.
pub const SENTINEL_DELETING: i64 = i64::MIN / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum PageState {
    Hot,
    Dirty,
    Clean,
}

impl PageState {
    fn encode(self) -> u8 {
        match self {
            PageState::Hot => 0,
            PageState::Dirty => 1,
            PageState::Clean => 2,
        }
    }

    fn decode(v: u8) -> Self {
        match v {
            0 => PageState::Hot,
            1 => PageState::Dirty,
            2 => PageState::Clean,
            other => unreachable!("corrupted page state byte: {other}"),
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PageFlags: u8 {
        const BEING_DELETED    = 1 << 0;
        const BEING_MIGRATED   = 1 << 1;
        const HAS_BEEN_ACCESSED = 1 << 2;
        const IGNORE_ACCESSES  = 1 << 3;
    }
}

/// Three-level identity key: `(section, metric_id, start_time)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub section: u64,
    pub metric_id: u64,
    pub start_time: i64,
}

/// Caller-facing insert/save payload (spec.md §6).
#[derive(Clone)]
pub struct PageEntryDescriptor {
    pub section: u64,
    pub metric_id: u64,
    pub start_time: i64,
    pub end_time: i64,
    pub update_every: u32,
    pub size: usize,
    pub data: Arc<[u8]>,
    pub custom_data: Option<Arc<[u8]>>,
    pub hot: bool,
}

/// The cache's internal representation of a page. Always handled behind an
/// `Arc<Page>` (aliased as [`PageHandle`]).
pub struct Page {
    pub(crate) key: PageKey,
    end_time: AtomicI64,
    update_every: AtomicU32,
    /// Accounting size: user size + fixed per-page overhead. Immutable
    /// after construction (spec.md §3 names it as an attribute, not as
    /// something that grows while HOT).
    pub(crate) assumed_size: usize,
    data: Arc<[u8]>,
    custom_data: Option<Arc<[u8]>>,
    state: AtomicU8,
    flags: AtomicU8,
    refcount: AtomicI64,
    accesses: AtomicU64,
    /// Per-page transition lock (spec.md §4.4 / §5). Linearizes observers
    /// of state-queue membership changes.
    pub(crate) transition_lock: Mutex<()>,
}

pub type PageHandle = Arc<Page>;

impl Page {
    pub(crate) fn new(desc: &PageEntryDescriptor) -> PageHandle {
        assert!(
            desc.start_time <= desc.end_time,
            "invariant violated: start_time must be <= end_time"
        );
        Arc::new(Page {
            key: PageKey {
                section: desc.section,
                metric_id: desc.metric_id,
                start_time: desc.start_time,
            },
            end_time: AtomicI64::new(desc.end_time),
            update_every: AtomicU32::new(desc.update_every),
            assumed_size: desc.size,
            data: desc.data.clone(),
            custom_data: desc.custom_data.clone(),
            state: AtomicU8::new(if desc.hot { PageState::Hot } else { PageState::Clean }.encode()),
            flags: AtomicU8::new(0),
            refcount: AtomicI64::new(0),
            accesses: AtomicU64::new(0),
            transition_lock: Mutex::new(()),
        })
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn end_time(&self) -> i64 {
        self.end_time.load(Ordering::Acquire)
    }

    /// Extend `end_time` while HOT. Never shrinks (spec.md invariant 5).
    pub fn extend_end_time(&self, new_end: i64) {
        self.end_time.fetch_max(new_end, Ordering::AcqRel);
    }

    pub fn update_every(&self) -> u32 {
        self.update_every.load(Ordering::Relaxed)
    }

    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    pub fn custom_data(&self) -> Option<&Arc<[u8]>> {
        self.custom_data.as_ref()
    }

    pub fn accesses(&self) -> u64 {
        self.accesses.load(Ordering::Relaxed)
    }

    /// Record a successful `find` (spec.md §4.5). Gated on
    /// `ignore_accesses`, which suppresses both this counter and the
    /// CLEAN-queue LRU move. Not called from `Index::insert`'s
    /// duplicate-acquire branch -- only a `find` counts as an access.
    pub(crate) fn record_access(&self) {
        if !self.has_flag(PageFlags::IGNORE_ACCESSES) {
            self.accesses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn descriptor(&self) -> PageEntryDescriptor {
        PageEntryDescriptor {
            section: self.key.section,
            metric_id: self.key.metric_id,
            start_time: self.key.start_time,
            end_time: self.end_time(),
            update_every: self.update_every(),
            size: self.assumed_size,
            data: self.data.clone(),
            custom_data: self.custom_data.clone(),
            hot: self.is_state(PageState::Hot),
        }
    }

    pub(crate) fn state(&self) -> PageState {
        PageState::decode(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_state(&self, s: PageState) -> bool {
        self.state() == s
    }

    pub(crate) fn set_state(&self, s: PageState) {
        self.state.store(s.encode(), Ordering::Release);
    }

    fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flag(&self, flag: PageFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, flag: PageFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub(crate) fn has_flag(&self, flag: PageFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn being_deleted(&self) -> bool {
        self.has_flag(PageFlags::BEING_DELETED)
    }

    pub fn being_migrated(&self) -> bool {
        self.has_flag(PageFlags::BEING_MIGRATED)
    }

    pub fn ignore_accesses(&self) -> bool {
        self.has_flag(PageFlags::IGNORE_ACCESSES)
    }

    /// Mark the page so neither the access counter nor the CLEAN-queue LRU
    /// move happens on a successful find (spec.md §4.5). Used for pages
    /// holding no data (e.g. placeholder/negative-cache entries).
    pub fn set_ignore_accesses(&self, ignore: bool) {
        if ignore {
            self.set_flag(PageFlags::IGNORE_ACCESSES);
        } else {
            self.clear_flag(PageFlags::IGNORE_ACCESSES);
        }
    }

    pub(crate) fn raw_refcount(&self) -> i64 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn refcount(&self) -> i64 {
        let rc = self.raw_refcount();
        if rc <= SENTINEL_DELETING {
            0
        } else {
            rc
        }
    }

    /// Acquire a reference: CAS loop, succeeds iff current refcount >= 0.
    /// Returns whether the 0 -> 1 transition happened (caller should bump
    /// `referenced_entries`/`referenced_size`) and whether it succeeded at
    /// all. Also returns the number of CAS retries for spin statistics.
    pub(crate) fn acquire(&self) -> AcquireOutcome {
        let mut spins = 0u32;
        loop {
            let current = self.refcount.load(Ordering::Acquire);
            if current < 0 {
                return AcquireOutcome {
                    acquired: false,
                    became_referenced: false,
                    spins,
                };
            }
            match self.refcount.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return AcquireOutcome {
                        acquired: true,
                        became_referenced: current == 0,
                        spins,
                    };
                }
                Err(_) => {
                    spins += 1;
                    continue;
                }
            }
        }
    }

    /// Decrement the refcount. Returns whether the 1 -> 0 transition
    /// happened (caller should decrement `referenced_entries`/`referenced_size`).
    pub(crate) fn release(&self) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "invariant violated: refcount underflow on release");
        prev == 1
    }

    /// CAS refcount from `expected` to [`SENTINEL_DELETING`]. Also sets
    /// `being_deleted`. Two call sites use this: from zero (evictor, while
    /// holding the CLEAN queue lock) and from one-and-owning (a caller
    /// holding the sole reference who wants to delete).
    pub(crate) fn reserve_for_deletion_from(&self, expected: i64) -> bool {
        match self.refcount.compare_exchange(
            expected,
            SENTINEL_DELETING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.set_flag(PageFlags::BEING_DELETED);
                true
            }
            Err(_) => false,
        }
    }
}

pub(crate) struct AcquireOutcome {
    pub acquired: bool,
    pub became_referenced: bool,
    pub spins: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(section: u64, metric: u64, start: i64, end: i64) -> PageEntryDescriptor {
        PageEntryDescriptor {
            section,
            metric_id: metric,
            start_time: start,
            end_time: end,
            update_every: 1,
            size: 4096,
            data: Arc::from(vec![0u8; 4096]),
            custom_data: None,
            hot: false,
        }
    }

    #[test]
    fn acquire_release_roundtrip() {
        let p = Page::new(&desc(1, 10, 100, 1000));
        assert_eq!(p.refcount(), 0);
        let out = p.acquire();
        assert!(out.acquired && out.became_referenced);
        assert_eq!(p.refcount(), 1);
        let out2 = p.acquire();
        assert!(out2.acquired && !out2.became_referenced);
        assert_eq!(p.refcount(), 2);
        assert!(!p.release());
        assert!(p.release());
        assert_eq!(p.refcount(), 0);
    }

    #[test]
    fn reserve_for_deletion_from_zero() {
        let p = Page::new(&desc(1, 10, 100, 1000));
        assert!(p.reserve_for_deletion_from(0));
        assert!(p.being_deleted());
        assert!(!p.acquire().acquired);
    }

    #[test]
    fn reserve_for_deletion_rejects_wrong_expected() {
        let p = Page::new(&desc(1, 10, 100, 1000));
        p.acquire();
        assert!(!p.reserve_for_deletion_from(0));
        assert!(p.reserve_for_deletion_from(1));
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn release_without_acquire_panics() {
        let p = Page::new(&desc(1, 10, 100, 1000));
        p.release();
    }

    #[test]
    fn end_time_never_shrinks() {
        let p = Page::new(&desc(1, 10, 100, 1000));
        p.extend_end_time(2000);
        assert_eq!(p.end_time(), 2000);
        p.extend_end_time(500);
        assert_eq!(p.end_time(), 2000);
    }
}

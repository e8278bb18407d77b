//! Adaptive sizing and pressure controller (spec.md §4.6), grounded on the
//! host's `MemoryPressureManager` (`src/memory/pressure.rs`): a spinlock-
//! guarded snapshot of usage, refreshed by whichever thread gets there
//! first, consulted cheaply by every producer/releaser on the hot path.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::PressureThresholds;

/// Current state relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    /// Below `evict_low`: no eviction needed.
    Idle,
    /// Between `evict_low` and `healthy`.
    Low,
    /// Between `healthy` and `aggressive_evict`.
    Healthy,
    /// Between `aggressive_evict` and `severe_pressure`.
    AggressiveEvict,
    /// At or above `severe_pressure`: evict synchronously regardless of
    /// `CacheOptions::EVICT_PAGES_INLINE`.
    Severe,
}

/// Snapshot of a single usage computation, per-mille of `wanted`.
#[derive(Debug, Clone, Copy)]
pub struct UsageSnapshot {
    pub current_size: usize,
    pub wanted_size: usize,
    pub per_mille: u32,
    pub level: PressureLevel,
}

fn classify(per_mille: u32, t: &PressureThresholds) -> PressureLevel {
    if per_mille >= t.severe_pressure {
        PressureLevel::Severe
    } else if per_mille >= t.aggressive_evict {
        PressureLevel::AggressiveEvict
    } else if per_mille >= t.healthy {
        PressureLevel::Healthy
    } else if per_mille >= t.evict_low {
        PressureLevel::Low
    } else {
        PressureLevel::Idle
    }
}

/// The controller's mutable state, refreshed under a short-held lock. Named
/// a spinlock in spec.md §5; `parking_lot::Mutex` already spins briefly
/// before parking, which matches that intent closely enough without
/// hand-rolled spin code.
struct Inner {
    wanted_size: usize,
    floor: usize,
}

pub(crate) struct PressureController {
    inner: Mutex<Inner>,
    thresholds: PressureThresholds,
    current_size: AtomicU64,
    referenced_size: AtomicU64,
    recomputations: AtomicU64,
    /// Counts every `usage()` call that classified as `Severe`, mirroring
    /// the source's `events_cache_under_severe_pressure` counter.
    severe_events: AtomicU64,
    /// Counts `AggressiveEvict` classifications, mirroring the source's
    /// `events_cache_needs_space_aggressively` counter.
    aggressive_events: AtomicU64,
    /// High-water mark of `hot_size` observed across recomputations. Reset
    /// only by `reset_hot_max` (spec.md §8 scenario 6).
    hot_max: AtomicU64,
    /// High-water mark of `dirty_size`. Unlike `hot_max` this is never
    /// reset explicitly -- `flush_critical`'s definition only names
    /// `hot_max`.
    dirty_max: AtomicU64,
    /// Counts recomputations observed with `dirty_size > hot_max`, mirroring
    /// the source's `events_flush_critical` counter (spec.md §4.6).
    flush_critical_events: AtomicU64,
}

impl PressureController {
    pub(crate) fn new(floor: usize, thresholds: PressureThresholds) -> Self {
        Self {
            inner: Mutex::new(Inner {
                wanted_size: floor,
                floor,
            }),
            thresholds,
            current_size: AtomicU64::new(0),
            referenced_size: AtomicU64::new(0),
            recomputations: AtomicU64::new(0),
            severe_events: AtomicU64::new(0),
            aggressive_events: AtomicU64::new(0),
            hot_max: AtomicU64::new(0),
            dirty_max: AtomicU64::new(0),
            flush_critical_events: AtomicU64::new(0),
        }
    }

    pub(crate) fn add_current(&self, delta: i64) {
        atomic_add_signed(&self.current_size, delta);
    }

    pub(crate) fn add_referenced(&self, delta: i64) {
        atomic_add_signed(&self.referenced_size, delta);
    }

    pub(crate) fn current_size(&self) -> usize {
        self.current_size.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn referenced_size(&self) -> usize {
        self.referenced_size.load(Ordering::Relaxed) as usize
    }

    /// Recompute `wanted_size` per spec.md §4.6. Without `AUTOSCALE` this is
    /// simply `hot_now + dirty_now + floor`. With `AUTOSCALE`:
    ///
    /// ```text
    /// wanted = min(2 * max(hot_max, hot_now),
    ///              hot_max + if dirty_max < hot_max/2 { hot_max/2 } else { 2*dirty_max })
    /// ```
    ///
    /// clamped below by `hot_now + dirty_now + floor`, floored by
    /// `(2/3) * referenced_size`, and only ever raised (never lowered) by
    /// `dynamic_target_size_cb`. `hot_max`/`dirty_max` are running
    /// high-water marks updated on every call; `flush_critical` fires here
    /// whenever `dirty_now` exceeds the (pre-update) `hot_max`.
    pub(crate) fn recompute_wanted(
        &self,
        hot_now: usize,
        dirty_now: usize,
        dynamic_cb: Option<&dyn Fn() -> usize>,
        autoscale: bool,
    ) -> usize {
        self.recomputations.fetch_add(1, Ordering::Relaxed);

        let hot_max_before = self.hot_max.load(Ordering::Acquire) as usize;
        if dirty_now > hot_max_before {
            self.flush_critical_events.fetch_add(1, Ordering::Relaxed);
        }
        self.hot_max.fetch_max(hot_now as u64, Ordering::AcqRel);
        self.dirty_max.fetch_max(dirty_now as u64, Ordering::AcqRel);
        let hot_max = self.hot_max.load(Ordering::Acquire) as usize;
        let dirty_max = self.dirty_max.load(Ordering::Acquire) as usize;

        let mut guard = self.inner.lock();
        let mut wanted = if autoscale {
            let term1 = 2 * hot_max.max(hot_now);
            let half_hot = hot_max / 2;
            let term2 = if dirty_max < half_hot {
                hot_max + half_hot
            } else {
                hot_max + 2 * dirty_max
            };
            let mut w = term1.min(term2);
            w = w.max(hot_now + dirty_now + guard.floor);
            w = w.max(self.referenced_size() * 2 / 3);
            w
        } else {
            hot_now + dirty_now + guard.floor
        };
        if autoscale {
            if let Some(cb) = dynamic_cb {
                wanted = wanted.max(cb());
            }
        }
        guard.wanted_size = wanted;
        wanted
    }

    /// Shrink the `hot_max` high-water mark back to zero (spec.md §8
    /// scenario 6: a caller that just ran a large eviction pass calls this
    /// so the next `AUTOSCALE` recomputation no longer pins `wanted` to the
    /// old high-water mark).
    pub(crate) fn reset_hot_max(&self) {
        self.hot_max.store(0, Ordering::Release);
    }

    pub(crate) fn flush_critical_events(&self) -> u64 {
        self.flush_critical_events.load(Ordering::Relaxed)
    }

    pub(crate) fn wanted_size(&self) -> usize {
        self.inner.lock().wanted_size
    }

    /// Compute a fresh usage snapshot against the last-computed
    /// `wanted_size`, without forcing a recompute (cheap, hot-path call).
    pub(crate) fn usage(&self) -> UsageSnapshot {
        let wanted = self.wanted_size().max(1);
        let current = self.current_size();
        let per_mille = ((current as u128 * 1000) / wanted as u128) as u32;
        let level = classify(per_mille, &self.thresholds);
        match level {
            PressureLevel::Severe => {
                self.severe_events.fetch_add(1, Ordering::Relaxed);
            }
            PressureLevel::AggressiveEvict => {
                self.aggressive_events.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        UsageSnapshot {
            current_size: current,
            wanted_size: wanted,
            per_mille,
            level,
        }
    }

    pub(crate) fn thresholds(&self) -> PressureThresholds {
        self.thresholds
    }

    pub(crate) fn severe_events(&self) -> u64 {
        self.severe_events.load(Ordering::Relaxed)
    }

    pub(crate) fn aggressive_events(&self) -> u64 {
        self.aggressive_events.load(Ordering::Relaxed)
    }
}

fn atomic_add_signed(counter: &AtomicU64, delta: i64) {
    if delta >= 0 {
        counter.fetch_add(delta as u64, Ordering::Relaxed);
    } else {
        counter.fetch_sub((-delta) as u64, Ordering::Relaxed);
    }
}

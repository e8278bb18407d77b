//! Programmatic configuration surface for the cache. No file/TOML loading
//! lives here (out of scope, spec.md §1) — only the builder/validation the
//! host applies to its own `BufferPoolConfig` (`src/buffer/manager.rs`).

use bitflags::bitflags;

use crate::error::{PgcError, Result};

bitflags! {
    /// Cache creation options (spec.md §6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheOptions: u8 {
        /// Producers/releasers perform eviction steps inline.
        const EVICT_PAGES_INLINE = 1 << 0;
        /// Producers perform flush steps inline after adds / hot->dirty.
        const FLUSH_PAGES_INLINE = 1 << 1;
        /// Enables the adaptive `wanted` computation of §4.6.
        const AUTOSCALE          = 1 << 2;
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::EVICT_PAGES_INLINE | Self::FLUSH_PAGES_INLINE | Self::AUTOSCALE
    }
}

const MIN_CLEAN_SIZE_FLOOR: usize = 1024 * 1024;
const MIN_PAGES_PER_INLINE_EVICTION: usize = 2;
const MIN_SKIP_PAGES_PER_INLINE_EVICTION: usize = 2;
const MIN_FLUSHES_INLINE: usize = 1;

/// Callback invoked by the flusher on a batch of now-durable-or-failed
/// DIRTY pages. Returning `Err` leaves the batch's pages DIRTY for a later
/// retry; the cache never rolls back a flush (spec.md §7).
pub type SaveDirtyCb = Box<dyn Fn(u64, &[crate::pgc::page::PageEntryDescriptor]) -> Result<()> + Send + Sync>;

/// Optional per-section hook invoked once before a batch's `SaveDirtyCb`.
pub type SaveInitCb = Box<dyn Fn(u64) -> Result<()> + Send + Sync>;

/// Deallocator for a page's caller-owned `data` pointer, invoked when a
/// CLEAN page is freed by the evictor.
pub type FreeCleanCb = Box<dyn Fn(crate::pgc::page::PageEntryDescriptor) + Send + Sync>;

/// Caller-supplied hook that may only *raise* `wanted` (never lower it —
/// the asymmetry is intentional, see DESIGN.md).
pub type DynamicTargetSizeCb = Box<dyn Fn() -> usize + Send + Sync>;

pub struct CacheConfig {
    pub options: CacheOptions,
    pub clean_size_floor: usize,
    pub max_dirty_pages_per_flush: usize,
    pub max_pages_per_inline_eviction: usize,
    pub max_skip_pages_per_inline_eviction: usize,
    pub max_flushes_inline: usize,
    pub max_inline_evictors: usize,
    pub partitions: usize,
    pub additional_bytes_per_page: usize,
    pub custom_data_size: usize,
    pub free_clean_cb: FreeCleanCb,
    pub save_dirty_cb: SaveDirtyCb,
    pub save_init_cb: Option<SaveInitCb>,
    pub dynamic_target_size_cb: Option<DynamicTargetSizeCb>,
    pub pressure_thresholds: PressureThresholds,
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }
}

pub struct CacheConfigBuilder {
    options: CacheOptions,
    clean_size_floor: usize,
    max_dirty_pages_per_flush: usize,
    max_pages_per_inline_eviction: usize,
    max_skip_pages_per_inline_eviction: usize,
    max_flushes_inline: usize,
    max_inline_evictors: usize,
    partitions: usize,
    additional_bytes_per_page: usize,
    custom_data_size: usize,
    free_clean_cb: Option<FreeCleanCb>,
    save_dirty_cb: Option<SaveDirtyCb>,
    save_init_cb: Option<SaveInitCb>,
    dynamic_target_size_cb: Option<DynamicTargetSizeCb>,
    pressure_thresholds: PressureThresholds,
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self {
            options: CacheOptions::default(),
            clean_size_floor: MIN_CLEAN_SIZE_FLOOR,
            max_dirty_pages_per_flush: 256,
            max_pages_per_inline_eviction: 64,
            max_skip_pages_per_inline_eviction: 64,
            max_flushes_inline: 4,
            max_inline_evictors: num_cpus_fallback(),
            partitions: num_cpus_fallback(),
            additional_bytes_per_page: 0,
            custom_data_size: 0,
            free_clean_cb: None,
            save_dirty_cb: None,
            save_init_cb: None,
            dynamic_target_size_cb: None,
            pressure_thresholds: PressureThresholds::default(),
        }
    }
}

/// The host uses `num_cpus` for default partition counts; that dependency
/// is not otherwise needed here, so we read the standard library's own
/// estimate instead (falls back to 4 if unavailable).
fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl CacheConfigBuilder {
    pub fn options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    pub fn clean_size_floor(mut self, bytes: usize) -> Self {
        self.clean_size_floor = bytes;
        self
    }

    pub fn max_dirty_pages_per_flush(mut self, n: usize) -> Self {
        self.max_dirty_pages_per_flush = n;
        self
    }

    pub fn max_pages_per_inline_eviction(mut self, n: usize) -> Self {
        self.max_pages_per_inline_eviction = n;
        self
    }

    pub fn max_skip_pages_per_inline_eviction(mut self, n: usize) -> Self {
        self.max_skip_pages_per_inline_eviction = n;
        self
    }

    pub fn max_flushes_inline(mut self, n: usize) -> Self {
        self.max_flushes_inline = n;
        self
    }

    pub fn max_inline_evictors(mut self, n: usize) -> Self {
        self.max_inline_evictors = n;
        self
    }

    pub fn partitions(mut self, n: usize) -> Self {
        self.partitions = n;
        self
    }

    pub fn additional_bytes_per_page(mut self, n: usize) -> Self {
        self.additional_bytes_per_page = n;
        self
    }

    pub fn custom_data_size(mut self, n: usize) -> Self {
        self.custom_data_size = n;
        self
    }

    pub fn free_clean_cb(mut self, cb: FreeCleanCb) -> Self {
        self.free_clean_cb = Some(cb);
        self
    }

    pub fn save_dirty_cb(mut self, cb: SaveDirtyCb) -> Self {
        self.save_dirty_cb = Some(cb);
        self
    }

    pub fn save_init_cb(mut self, cb: SaveInitCb) -> Self {
        self.save_init_cb = Some(cb);
        self
    }

    pub fn dynamic_target_size_cb(mut self, cb: DynamicTargetSizeCb) -> Self {
        self.dynamic_target_size_cb = Some(cb);
        self
    }

    pub fn pressure_thresholds(mut self, thresholds: PressureThresholds) -> Self {
        self.pressure_thresholds = thresholds;
        self
    }

    pub fn build(self) -> Result<CacheConfig> {
        if self.partitions == 0 {
            return Err(PgcError::InvalidConfig("partitions must be >= 1".into()));
        }
        let free_clean_cb = self
            .free_clean_cb
            .ok_or_else(|| PgcError::InvalidConfig("free_clean_cb is required".into()))?;
        let save_dirty_cb = self
            .save_dirty_cb
            .ok_or_else(|| PgcError::InvalidConfig("save_dirty_cb is required".into()))?;

        Ok(CacheConfig {
            options: self.options,
            clean_size_floor: self.clean_size_floor.max(MIN_CLEAN_SIZE_FLOOR),
            max_dirty_pages_per_flush: self.max_dirty_pages_per_flush.max(1),
            max_pages_per_inline_eviction: self
                .max_pages_per_inline_eviction
                .max(MIN_PAGES_PER_INLINE_EVICTION),
            max_skip_pages_per_inline_eviction: self
                .max_skip_pages_per_inline_eviction
                .max(MIN_SKIP_PAGES_PER_INLINE_EVICTION),
            max_flushes_inline: self.max_flushes_inline.max(MIN_FLUSHES_INLINE),
            max_inline_evictors: self.max_inline_evictors.max(1),
            partitions: self.partitions,
            additional_bytes_per_page: self.additional_bytes_per_page,
            custom_data_size: self.custom_data_size,
            free_clean_cb,
            save_dirty_cb,
            save_init_cb: self.save_init_cb,
            dynamic_target_size_cb: self.dynamic_target_size_cb,
            pressure_thresholds: self.pressure_thresholds,
        })
    }
}

/// Per-mille pressure thresholds (spec.md §4.6). Defaults match the
/// originating system's `cache_init_defaults`.
#[derive(Debug, Clone, Copy)]
pub struct PressureThresholds {
    pub severe_pressure: u32,
    pub aggressive_evict: u32,
    pub healthy: u32,
    pub evict_low: u32,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            severe_pressure: 1010,
            aggressive_evict: 990,
            healthy: 980,
            evict_low: 970,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_below_minimums() {
        let cfg = CacheConfig::builder()
            .clean_size_floor(0)
            .max_pages_per_inline_eviction(1)
            .max_skip_pages_per_inline_eviction(0)
            .max_flushes_inline(0)
            .free_clean_cb(Box::new(|_| {}))
            .save_dirty_cb(Box::new(|_, _| Ok(())))
            .build()
            .unwrap();
        assert_eq!(cfg.clean_size_floor, MIN_CLEAN_SIZE_FLOOR);
        assert_eq!(cfg.max_pages_per_inline_eviction, MIN_PAGES_PER_INLINE_EVICTION);
        assert_eq!(cfg.max_skip_pages_per_inline_eviction, MIN_SKIP_PAGES_PER_INLINE_EVICTION);
        assert_eq!(cfg.max_flushes_inline, MIN_FLUSHES_INLINE);
    }

    #[test]
    fn requires_callbacks() {
        let err = CacheConfig::builder().build().unwrap_err();
        assert!(matches!(err, PgcError::InvalidConfig(_)));
    }

    #[test]
    fn default_options_match_source_defaults() {
        let opts = CacheOptions::default();
        assert!(opts.contains(CacheOptions::EVICT_PAGES_INLINE));
        assert!(opts.contains(CacheOptions::FLUSH_PAGES_INLINE));
        assert!(opts.contains(CacheOptions::AUTOSCALE));
    }
}

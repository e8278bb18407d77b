//! Concurrent page cache with lifecycle-managed entries, plus its two
//! collaborators: a metric registry ([`mrg`]) and a compressed log store
//! with a range/keyword query layer ([`logs`]).
//!
//! [`pgc::Cache`] is the core: an in-memory index of `(section, metric_id,
//! start_time) -> Page` mediating HOT/DIRTY/CLEAN transitions under
//! refcounting, with adaptive eviction and flushing. It never touches
//! disk itself -- durability is delegated entirely to the caller's
//! `save_dirty_cb` (see [`config`]).

pub mod config;
pub mod error;
pub mod logs;
pub mod mrg;
pub mod pgc;

pub use config::{CacheConfig, CacheConfigBuilder, CacheOptions, PressureThresholds};
pub use error::{PgcError, QueryErrorKind, Result};
pub use logs::{LogStore, QueryRequest, QueryResult};
pub use mrg::MetricRegistry;
pub use pgc::{Cache, JournalExtent, JournalIndexes, MetricJournalEntry, PageEntryDescriptor, PageHandle, SearchMethod};

/// Install a process-wide `tracing` subscriber suited to running the cache
/// as a library inside a larger service, mirroring the host's own
/// `main.rs` setup (`tracing_subscriber::fmt()` with thread ids and no
/// target module path). Optional: callers embedding this crate are free
/// to install their own subscriber instead and never call this.
pub fn init_tracing() {
    use tracing_subscriber::fmt;
    let _ = fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init();
}

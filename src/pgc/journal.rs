//! Journal-migration export (spec.md §4.9): enumerate a section's HOT pages
//! belonging to one on-disk datafile, hand the caller three rebuilt indexes
//! over them, then transition the migrated pages HOT -> DIRTY so a later
//! flush persists them under their new journal. Grounded on the host's
//! `PageTable::pages_for_table` style full-section scan
//! (`src/buffer/manager.rs`), adapted from frame ids to page handles.

use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;

use crate::error::{PgcError, Result};
use crate::pgc::page::{Page, PageEntryDescriptor, PageFlags, PageState};
use crate::pgc::queues::SectionedQueue;

/// One exported page, tagged with its position in export order.
pub struct JournalExtent {
    pub position: usize,
    pub descriptor: PageEntryDescriptor,
}

/// Per-metric retention summary built while exporting, so the caller's new
/// journal can rebuild its own metric-bounds bookkeeping without a second
/// pass over the pages (spec.md §4.9).
pub struct MetricJournalEntry {
    pub metric_id: u64,
    pub first_time: i64,
    pub last_time: i64,
    pub count: usize,
    pub pages_by_start_time: BTreeMap<i64, usize>,
}

/// The three indexes spec.md §4.9 requires the export to hand back:
/// extents in export order, metrics keyed by id (with retention and a
/// start-time -> position map each), and (implicitly, via
/// `pages_by_start_time`) pages-by-start-time per metric.
pub struct JournalIndexes {
    pub extents: Vec<JournalExtent>,
    pub metrics: BTreeMap<u64, MetricJournalEntry>,
}

/// Decode the `fileno` tag a producer is expected to have stashed as the
/// first 4 little-endian bytes of `custom_data` (spec.md §4.9: pages are
/// filtered by `custom_data.fileno == datafile_id`).
fn fileno_of(page: &Page) -> Option<u32> {
    let bytes = page.custom_data()?;
    let slice: [u8; 4] = bytes.get(0..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(slice))
}

/// Export every HOT page of `section` tagged with `datafile_id`, build the
/// retention indexes, hand them to `callback`, then transition the
/// exported pages HOT -> DIRTY. Enforces a single migrator per section at a
/// time (spec.md §4.9's per-section try-spinlock): a concurrent call for
/// the same section fails immediately with
/// [`PgcError::MigrationInProgress`] rather than blocking.
pub(crate) fn open_cache_to_journal_v2<F>(
    hot: &SectionedQueue,
    dirty: &SectionedQueue,
    migrating_sections: &Mutex<HashSet<u64>>,
    section: u64,
    datafile_id: u32,
    callback: F,
) -> Result<()>
where
    F: FnOnce(JournalIndexes),
{
    {
        let mut guard = migrating_sections.lock();
        if !guard.insert(section) {
            return Err(PgcError::MigrationInProgress);
        }
    }
    let result = run_migration(hot, dirty, section, datafile_id, callback);
    migrating_sections.lock().remove(&section);
    result
}

fn run_migration<F>(hot: &SectionedQueue, dirty: &SectionedQueue, section: u64, datafile_id: u32, callback: F) -> Result<()>
where
    F: FnOnce(JournalIndexes),
{
    let snapshot = hot.section_snapshot(section);
    let mut migrated = Vec::new();
    let mut extents = Vec::new();
    let mut metrics: BTreeMap<u64, MetricJournalEntry> = BTreeMap::new();

    for page in &snapshot {
        if fileno_of(page) != Some(datafile_id) {
            continue;
        }
        let outcome = page.acquire();
        if !outcome.acquired {
            continue;
        }
        // Held only long enough to flag the page and snapshot its
        // descriptor -- never across `callback`, matching the crate-wide
        // rule that no lock spans a callback invocation.
        let descriptor = {
            let _transition = page.transition_lock.lock();
            page.set_flag(PageFlags::BEING_MIGRATED);
            page.descriptor()
        };

        let position = extents.len();
        let entry = metrics.entry(descriptor.metric_id).or_insert_with(|| MetricJournalEntry {
            metric_id: descriptor.metric_id,
            first_time: descriptor.start_time,
            last_time: descriptor.end_time,
            count: 0,
            pages_by_start_time: BTreeMap::new(),
        });
        entry.first_time = entry.first_time.min(descriptor.start_time);
        entry.last_time = entry.last_time.max(descriptor.end_time);
        entry.count += 1;
        entry.pages_by_start_time.insert(descriptor.start_time, position);

        extents.push(JournalExtent { position, descriptor });
        migrated.push(page.clone());
    }

    callback(JournalIndexes { extents, metrics });

    // HOT -> DIRTY for the whole migrated batch. The HOT queue lock is
    // taken once for the batch, with each page's transition lock nested
    // inside it, matching the crate-wide "HOT lock before transition lock"
    // ordering (spec.md §4.4/§5) rather than per-page locking that would
    // reintroduce the deadlock that ordering exists to avoid.
    {
        let mut hot_guard = hot.lock_sections();
        for page in &migrated {
            let _transition = page.transition_lock.lock();
            page.clear_flag(PageFlags::BEING_MIGRATED);
            hot.remove_locked(&mut hot_guard, page);
            page.set_state(PageState::Dirty);
        }
    }
    for page in &migrated {
        dirty.add(page);
        dirty.bump_version();
        page.release();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgc::index::{Index, InsertOutcome};
    use std::sync::Arc;

    fn desc_with_fileno(start: i64, fileno: u32) -> PageEntryDescriptor {
        PageEntryDescriptor {
            section: 7,
            metric_id: 1,
            start_time: start,
            end_time: start + 10,
            update_every: 1,
            size: 32,
            data: Arc::from(vec![0u8; 4]),
            custom_data: Some(Arc::from(fileno.to_le_bytes())),
            hot: true,
        }
    }

    #[test]
    fn exports_only_pages_matching_datafile_id_and_builds_indexes() {
        let index = Index::new(2);
        let hot = SectionedQueue::new();
        let dirty = SectionedQueue::new();
        let migrating = Mutex::new(HashSet::new());

        for i in 0..3 {
            let page = match index.insert(&desc_with_fileno(i, 1)) {
                InsertOutcome::Added(p) => p,
                InsertOutcome::Existing(p) => p,
            };
            hot.add(&page);
            page.release();
        }
        // A page from a different datafile must not be exported.
        let other = match index.insert(&desc_with_fileno(100, 2)) {
            InsertOutcome::Added(p) => p,
            InsertOutcome::Existing(p) => p,
        };
        hot.add(&other);
        other.release();

        let mut seen = Vec::new();
        open_cache_to_journal_v2(&hot, &dirty, &migrating, 7, 1, |indexes| {
            seen = indexes.extents.iter().map(|e| e.descriptor.start_time).collect();
            assert_eq!(indexes.metrics.len(), 1);
            let metric = indexes.metrics.get(&1).unwrap();
            assert_eq!(metric.count, 3);
            assert_eq!(metric.first_time, 0);
            assert_eq!(metric.last_time, 12);
        })
        .unwrap();

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(hot.section_len(7), 1, "only the non-matching page remains HOT");
        assert_eq!(dirty.section_len(7), 3, "matching pages transition to DIRTY");
    }

    #[test]
    fn concurrent_migration_of_same_section_is_rejected() {
        let hot = SectionedQueue::new();
        let dirty = SectionedQueue::new();
        let migrating = Mutex::new(HashSet::new());
        migrating.lock().insert(7);

        let result = open_cache_to_journal_v2(&hot, &dirty, &migrating, 7, 1, |_| {});
        assert!(matches!(result, Err(PgcError::MigrationInProgress)));
    }
}

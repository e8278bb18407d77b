//! Log store + query collaborator (spec.md §4.11, §6 persisted-state
//! layout). Durability delegated to this module entirely -- the cache
//! itself never touches disk (spec.md §1 Non-goals). Grounded on the
//! original's `logsmanagement/db_api.c` (`sqlite3_prepare_v2`, `PRAGMA
//! user_version`, `BEGIN TRANSACTION`, `LogCollections`/`Blobs`/`Logs`
//! schema) for the metadata databases, with `LZ4_decompress_safe` block
//! compression substituted by `flate2`/gzip (see DESIGN.md for the
//! substitution rationale).

pub mod blobs;
pub mod catalog;
pub mod query;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{PgcError, Result};

pub use crate::logs::blobs::BlobRing;
pub use crate::logs::catalog::Catalog;
pub use crate::logs::query::{QueryRequest, QueryResult};

/// One log source: a UUID identity (doubling as its `DB_Dir` name), the
/// catalog's `Stream_Tag` describing it, and its own rotating blob ring
/// plus per-source `Blobs`/`Logs` metadata DB (spec.md §3 "Log store
/// per-source metadata DB + blob ring").
pub struct LogSource {
    pub uuid: Uuid,
    pub name: String,
    blobs: BlobRing,
}

impl LogSource {
    pub fn blobs(&self) -> &BlobRing {
        &self.blobs
    }
}

pub type LogSourceHandle = Arc<LogSource>;

/// Top-level store: one `main.db` (the `Catalog`'s `LogCollections` table)
/// naming every known source, each source backed by its own `DB_Dir`
/// directory of `logs.bin.<N>` blob files plus a `metadata.db` (spec.md §6).
pub struct LogStore {
    root: PathBuf,
    catalog: Catalog,
    sources: RwLock<std::collections::HashMap<Uuid, LogSourceHandle>>,
    blobs_per_source: usize,
}

impl LogStore {
    pub fn open(root: impl AsRef<Path>, blobs_per_source: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let catalog = Catalog::open(root.join("main.db"))?;
        let mut sources = std::collections::HashMap::new();
        for row in catalog.list_collections()? {
            let uuid = Uuid::parse_str(&row.db_dir)
                .map_err(|e| PgcError::Corruption(format!("bad DB_Dir uuid in LogCollections: {e}")))?;
            let dir = root.join(&row.db_dir);
            std::fs::create_dir_all(&dir)?;
            let blobs = BlobRing::open(dir, blobs_per_source)?;
            sources.insert(
                uuid,
                Arc::new(LogSource {
                    uuid,
                    name: row.stream_tag,
                    blobs,
                }),
            );
        }
        Ok(Self {
            root,
            catalog,
            sources: RwLock::new(sources),
            blobs_per_source,
        })
    }

    /// Register a new log source, creating its `DB_Dir` and an empty blob
    /// ring. Idempotent by `stream_tag`: the lookup mirrors
    /// `db_api.c`'s "count existing rows, reuse `DB_Dir` if found" sequence,
    /// keyed here on the in-memory source list rather than a second SQL
    /// round-trip since every known source is already resident.
    pub fn register_source(&self, stream_tag: &str) -> Result<LogSourceHandle> {
        self.register_source_with_path(stream_tag, stream_tag, 0)
    }

    /// Full form of [`LogStore::register_source`], exposing the
    /// `Log_Source_Path`/`Type` columns the catalog schema carries
    /// alongside `Stream_Tag` (spec.md §6).
    pub fn register_source_with_path(&self, stream_tag: &str, log_source_path: &str, log_type: i64) -> Result<LogSourceHandle> {
        if let Some(existing) = self
            .sources
            .read()
            .values()
            .find(|s| s.name == stream_tag)
        {
            return Ok(existing.clone());
        }
        let uuid = Uuid::new_v4();
        let db_dir = uuid.to_string();
        self.catalog.insert_collection(stream_tag, log_source_path, log_type, &db_dir)?;
        let dir = self.root.join(&db_dir);
        std::fs::create_dir_all(&dir)?;
        let blobs = BlobRing::open(dir, self.blobs_per_source)?;
        let handle = Arc::new(LogSource {
            uuid,
            name: stream_tag.to_string(),
            blobs,
        });
        self.sources.write().insert(uuid, handle.clone());
        Ok(handle)
    }

    pub fn source(&self, uuid: Uuid) -> Option<LogSourceHandle> {
        self.sources.read().get(&uuid).cloned()
    }

    pub fn sources(&self) -> Vec<LogSourceHandle> {
        self.sources.read().values().cloned().collect()
    }

    /// Append an already-compressed (or raw, if the caller skipped
    /// compression) record to `source`'s current blob, rotating if the
    /// active blob has reached its size target, and indexing it into that
    /// source's `Logs` table as it happens (spec.md §4.11).
    pub fn append(&self, source: &LogSourceHandle, timestamp_ns: i64, payload: &[u8]) -> Result<()> {
        source.blobs.append(timestamp_ns, payload)
    }

    /// Run a query against one or more sources (spec.md §4.11, §6 error
    /// taxonomy). See [`query::run`] for the cancellation/deadline model
    /// and the single-source vs. `ATTACH`+`UNION ALL` compound-query split.
    pub fn query(&self, request: &QueryRequest) -> QueryResult {
        let sources: Vec<LogSourceHandle> = request
            .sources
            .iter()
            .filter_map(|uuid| self.source(*uuid))
            .collect();
        query::run(&sources, request)
    }
}

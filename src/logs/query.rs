//! Range + keyword query across one or more log sources (spec.md §4.11,
//! §6 error taxonomy), grounded on `logsmanagement/db_api.c`'s single-DB
//! prepared-statement query and its `db_search` multi-DB compound query
//! (`ATTACH DATABASE` + a `UNION ALL` over each attached source's `Logs`
//! table, ordered by `Timestamp`). Candidates are resolved entirely by SQL
//! against the `Logs.Timestamp` index; only the rows that survive the
//! range (and, for single-source, none of the filtering) are read back off
//! disk and decompressed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OpenFlags};
use uuid::Uuid;

use crate::error::{PgcError, QueryErrorKind, Result};
use crate::logs::blobs::read_record_at;
use crate::logs::LogSourceHandle;

/// Cooperative cancellation token. Cheap to clone and check; a caller
/// holds one side and flips it, the query loop polls the other
/// (spec.md §6 "cancellation model": checked between records, never
/// preempts mid-record).
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct QueryRequest {
    pub sources: Vec<Uuid>,
    pub start_ns: i64,
    pub end_ns: i64,
    pub keyword: Option<String>,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelToken>,
    pub max_results: usize,
}

impl QueryRequest {
    pub fn new(sources: Vec<Uuid>, start_ns: i64, end_ns: i64) -> Self {
        Self {
            sources,
            start_ns,
            end_ns,
            keyword: None,
            deadline: None,
            cancel: None,
            max_results: usize::MAX,
        }
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

pub struct LogRecord {
    pub source: Uuid,
    pub timestamp_ns: i64,
    pub line: Vec<u8>,
}

pub struct QueryResult {
    pub kind: QueryErrorKind,
    pub records: Vec<LogRecord>,
}

/// A `Logs` row resolved by SQL but not yet read off disk: everything
/// needed to seek straight to the record (spec.md §4.11: the query layer
/// never falls back to a linear blob scan).
struct Candidate {
    source: Uuid,
    timestamp_ns: i64,
    blob_path: PathBuf,
    offset: i64,
}

/// Run `request` across `sources`. Returns `NoMatchingSource` if the
/// caller named sources that don't resolve, `NoResults` if the scan
/// completed with nothing matching, `Timeout`/`Cancelled` with whatever
/// partial results had already been collected, matching spec.md §6's
/// "partial results attached" rows.
pub fn run(sources: &[LogSourceHandle], request: &QueryRequest) -> QueryResult {
    if sources.is_empty() {
        return QueryResult {
            kind: QueryErrorKind::NoMatchingSource,
            records: Vec::new(),
        };
    }

    let candidates = if sources.len() == 1 {
        single_source_candidates(&sources[0], request)
    } else {
        compound_candidates(sources, request)
    };
    let candidates = match candidates {
        Ok(c) => c,
        Err(_) => {
            return QueryResult {
                kind: QueryErrorKind::NoMatchingSource,
                records: Vec::new(),
            }
        }
    };

    let mut out = Vec::new();
    for candidate in candidates {
        if request.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return QueryResult {
                kind: QueryErrorKind::Cancelled,
                records: out,
            };
        }
        if let Some(deadline) = request.deadline {
            if Instant::now() >= deadline {
                return QueryResult {
                    kind: QueryErrorKind::Timeout,
                    records: out,
                };
            }
        }

        let (ts, bytes) = match read_record_at(&candidate.blob_path, candidate.offset) {
            Ok(record) => record,
            Err(_) => continue,
        };
        debug_assert_eq!(ts, candidate.timestamp_ns);

        if let Some(keyword) = &request.keyword {
            if !contains_subslice(&bytes, keyword.as_bytes()) {
                continue;
            }
        }

        out.push(LogRecord {
            source: candidate.source,
            timestamp_ns: candidate.timestamp_ns,
            line: bytes,
        });
        if out.len() >= request.max_results {
            return QueryResult {
                kind: QueryErrorKind::Ok,
                records: out,
            };
        }
    }

    let kind = if out.is_empty() {
        QueryErrorKind::NoResults
    } else {
        QueryErrorKind::Ok
    };
    QueryResult { kind, records: out }
}

/// Single-source path: a direct prepared statement against that source's
/// own `metadata.db`, bound to the requested range, ordered by
/// `Timestamp` ascending (spec.md §4.11; mirrors `db_api.c`'s single-DB
/// query without the `db_search` ATTACH machinery).
fn single_source_candidates(source: &LogSourceHandle, request: &QueryRequest) -> Result<Vec<Candidate>> {
    let conn = Connection::open_with_flags(
        source.blobs().metadata_db_path(),
        OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?;
    let mut stmt = conn.prepare(
        "SELECT l.Timestamp, l.BLOB_Offset, b.Filename
         FROM Logs l JOIN Blobs b ON b.Id = l.FK_BLOB_Id
         WHERE l.Timestamp >= ?1 AND l.Timestamp <= ?2
         ORDER BY l.Timestamp ASC",
    )?;
    let rows = stmt.query_map(params![request.start_ns, request.end_ns], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (ts, offset, filename) = row?;
        out.push(Candidate {
            source: source.uuid,
            timestamp_ns: ts,
            blob_path: source.blobs().dir().join(filename),
            offset,
        });
    }
    Ok(out)
}

/// Multi-source compound path, grounded on `db_api.c`'s `db_search`:
/// `ATTACH DATABASE` every source's `metadata.db` under a numbered alias,
/// then `UNION ALL` a tagged projection of each attached `Logs`/`Blobs`
/// join so the merged result stays traceable back to its source, and
/// finally filter+order the union by `Timestamp` in one pass.
fn compound_candidates(sources: &[LogSourceHandle], request: &QueryRequest) -> Result<Vec<Candidate>> {
    let conn = Connection::open_in_memory()?;
    for (i, source) in sources.iter().enumerate() {
        let path = source.blobs().metadata_db_path();
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS db{i}"),
            params![path.to_string_lossy()],
        )?;
    }

    let union_sql = (0..sources.len())
        .map(|i| {
            format!(
                "SELECT l.Timestamp AS Timestamp, l.BLOB_Offset AS BLOB_Offset, b.Filename AS Filename, {i} AS SrcIdx \
                 FROM db{i}.Logs l JOIN db{i}.Blobs b ON b.Id = l.FK_BLOB_Id"
            )
        })
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    let sql = format!(
        "SELECT Timestamp, BLOB_Offset, Filename, SrcIdx FROM ({union_sql}) \
         WHERE Timestamp >= ?1 AND Timestamp <= ?2 ORDER BY Timestamp ASC"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![request.start_ns, request.end_ns], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)? as usize,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (ts, offset, filename, idx) = row?;
        let source = sources
            .get(idx)
            .ok_or_else(|| PgcError::Corruption(format!("compound query returned unknown source index {idx}")))?;
        out.push(Candidate {
            source: source.uuid,
            timestamp_ns: ts,
            blob_path: source.blobs().dir().join(filename),
            offset,
        });
    }
    Ok(out)
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

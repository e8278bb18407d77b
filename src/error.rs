use thiserror::Error;

/// Recoverable failures surfaced by the cache, the metric registry, and the
/// log store. Invariant violations (corrupted index/queue/refcount state)
/// are never represented here: per the cache's error-handling contract they
/// are fatal and abort the process via `panic!`/`unreachable!` at the call
/// site, not returned as a `Result`.
#[derive(Error, Debug)]
pub enum PgcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("page could not be acquired: it is being deleted")]
    AcquireFailed,

    #[error("no matching source: {0}")]
    NoMatchingSource(String),

    #[error("query cancelled")]
    Cancelled,

    #[error("query deadline exceeded")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("save-dirty callback failed: {0}")]
    SaveFailed(String),

    #[error("free-clean callback failed: {0}")]
    FreeFailed(String),

    #[error("log store corruption: {0}")]
    Corruption(String),

    #[error("a journal migration is already running for this section")]
    MigrationInProgress,
}

pub type Result<T> = std::result::Result<T, PgcError>;

/// Error taxonomy for the log-store query collaborator (spec.md §6). Kept
/// distinct from `PgcError`: it is not a `std::error::Error`, it is the
/// *result kind* a query reports alongside a (possibly partial) result set,
/// matching 1:1 onto the HTTP status an embedding API would pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// 200
    Ok,
    /// 502
    Generic,
    /// 400
    InvalidRequest,
    /// 400
    NoMatchingSource,
    /// 200
    NoResults,
    /// 200, partial results attached
    Timeout,
    /// 200, partial results attached
    Cancelled,
    /// 304
    Unmodified,
}

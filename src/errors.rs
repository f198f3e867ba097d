use thiserror::Error;

/// Every failure the engine can surface. Transaction-level callers map these
/// onto abort decisions; `UnorderedBatch` never escapes the index layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// Insert of a primary key that already exists.
    #[error("duplicate primary key {0}")]
    DuplicateKey(i64),

    /// Lookup, update, or delete of a key with no live record.
    #[error("no record with key {0}")]
    NoSuchKey(i64),

    /// A RID that the page directory cannot resolve.
    #[error("rid {0} is not mapped in the page directory")]
    UnmappedRid(String),

    /// Another transaction holds an incompatible lock.
    #[error("lock conflict on {0}")]
    LockConflict(String),

    /// Bulk-insert keys must be sorted and strictly above the tree maximum.
    #[error("batch keys must be sorted above the current tree maximum")]
    UnorderedBatch,

    /// Page is neither resident nor present in the backing directory.
    #[error("page {0} is not resident and has no backing file")]
    PageMiss(String),

    /// Append to a page that reports no capacity.
    #[error("page is full")]
    PageFull,

    /// Offset is out of bounds.
    #[error("offset {0} is out of bounds")]
    OffsetOutOfBounds(usize),

    /// A path that does not follow the `<table>/pagerange_<P>/<base|tail>/page_<N>` layout.
    #[error("malformed page path {0}")]
    MalformedPath(String),

    /// A RID string that is not `b<N>` or `t<N>`.
    #[error("malformed rid {0}")]
    MalformedRid(String),

    /// Wrong number of columns supplied to insert or update.
    #[error("expected {expected} columns, got {actual}")]
    ColumnCountMismatch { expected: usize, actual: usize },

    /// No table with the given name in the database directory.
    #[error("no table named {0}")]
    NoSuchTable(String),

    /// Buffer-pool or metadata I/O failure.
    #[error("I/O failure: {0}")]
    Io(String),
}

impl From<std::io::Error> for DatabaseError {
    fn from(error: std::io::Error) -> Self {
        DatabaseError::Io(error.to_string())
    }
}

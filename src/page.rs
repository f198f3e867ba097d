use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::{PAGE_RANGE_SIZE, RECORDS_PER_PAGE};
use crate::errors::DatabaseError;
use crate::record::{Lane, Record, Rid};

/// A fixed-capacity, append-only container of whole records. Uniqueness is
/// the caller's concern; the page only tracks occupancy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Page {
    records: Vec<Record>,
}

impl Page {
    pub fn new() -> Self {
        Page {
            records: Vec::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.records.len() < RECORDS_PER_PAGE
    }

    pub fn num_records(&self) -> usize {
        self.records.len()
    }

    /// Append a record, returning the offset it landed at.
    pub fn write(&mut self, record: Record) -> Result<usize, DatabaseError> {
        if !self.has_capacity() {
            return Err(DatabaseError::PageFull);
        }

        self.records.push(record);
        Ok(self.records.len() - 1)
    }

    pub fn read(&self, offset: usize) -> Result<&Record, DatabaseError> {
        self.records
            .get(offset)
            .ok_or(DatabaseError::OffsetOutOfBounds(offset))
    }

    /// The one sanctioned in-place mutation: swing a base record's version
    /// pointer to the newest tail and refresh its schema encoding.
    pub fn update_indirection(
        &mut self,
        offset: usize,
        indirection: Rid,
        schema_encoding: u64,
    ) -> Result<(), DatabaseError> {
        let record = self
            .records
            .get_mut(offset)
            .ok_or(DatabaseError::OffsetOutOfBounds(offset))?;

        record.indirection = indirection;
        record.schema_encoding = schema_encoding;
        Ok(())
    }

    /// Replace a base record's column image during a merge. RID, indirection
    /// and schema encoding stay untouched.
    pub fn overwrite_columns(
        &mut self,
        offset: usize,
        columns: Vec<Option<i64>>,
    ) -> Result<(), DatabaseError> {
        let record = self
            .records
            .get_mut(offset)
            .ok_or(DatabaseError::OffsetOutOfBounds(offset))?;

        record.columns = columns;
        Ok(())
    }
}

/// Structured form of `<table>/pagerange_<P>/<base|tail>/page_<N>`. Kept
/// structured in memory so hot paths never re-parse; rendered to the string
/// form for the buffer pool and the lock manager.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PagePath {
    pub table: String,
    pub pagerange: usize,
    pub lane: Lane,
    pub page: usize,
}

impl PagePath {
    pub fn base(table: &str, pagerange: usize, page: usize) -> Self {
        PagePath {
            table: table.to_string(),
            pagerange,
            lane: Lane::Base,
            page,
        }
    }

    pub fn tail(table: &str, pagerange: usize, page: usize) -> Self {
        PagePath {
            table: table.to_string(),
            pagerange,
            lane: Lane::Tail,
            page,
        }
    }

    /// Parse a rendered path. Splits on `pagerange_` and `page_` exactly as
    /// the persisted layout promises.
    pub fn parse(path: &str) -> Result<Self, DatabaseError> {
        let malformed = || DatabaseError::MalformedPath(path.to_string());

        let (table, rest) = path.split_once("/pagerange_").ok_or_else(malformed)?;
        let mut components = rest.splitn(3, '/');

        let pagerange = components
            .next()
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or_else(malformed)?;
        let lane = match components.next() {
            Some("base") => Lane::Base,
            Some("tail") => Lane::Tail,
            _ => return Err(malformed()),
        };
        let page = components
            .next()
            .and_then(|raw| raw.strip_prefix("page_"))
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or_else(malformed)?;

        Ok(PagePath {
            table: table.to_string(),
            pagerange,
            lane,
            page,
        })
    }
}

impl fmt::Display for PagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/pagerange_{}/{}/page_{}",
            self.table, self.pagerange, self.lane, self.page
        )
    }
}

/// Bookkeeping for one page range: which base and tail pages are currently
/// being filled, how many updates have landed since the last merge, and the
/// transaction-point-stamp the merge worker publishes through.
#[derive(Debug)]
pub struct PageRange {
    pub index: usize,

    /// Index of the base page currently accepting inserts. Once it reaches
    /// `PAGE_RANGE_SIZE - 1` and fills, the range is closed for bases.
    pub next_base_page: usize,

    /// Index of the tail page currently accepting updates. Unbounded.
    pub next_tail_page: usize,

    /// Updates since the last merge request for this range.
    pub unmerged_updates: usize,

    /// Largest tail sequence number folded into the base lane so far.
    /// Shared with the merge worker.
    pub tps: Arc<AtomicU64>,
}

impl PageRange {
    pub fn new(index: usize) -> Self {
        PageRange {
            index,
            next_base_page: 0,
            next_tail_page: 0,
            unmerged_updates: 0,
            tps: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Path of the base page currently being filled.
    pub fn base_path(&self, table: &str) -> PagePath {
        PagePath::base(table, self.index, self.next_base_page)
    }

    /// Path of the newest tail page.
    pub fn tail_path(&self, table: &str) -> PagePath {
        PagePath::tail(table, self.index, self.next_tail_page)
    }

    /// Whether another base page can still be minted inside this range.
    pub fn has_base_room(&self) -> bool {
        self.next_base_page + 1 < PAGE_RANGE_SIZE
    }
}

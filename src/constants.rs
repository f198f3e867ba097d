/// The number of (logical) base pages per page range.
pub const PAGE_RANGE_SIZE: usize = 16;

/// Number of records that can be stored in a page.
pub const RECORDS_PER_PAGE: usize = 512;

/// Number of unmerged updates a page range accumulates before a merge is requested.
pub const MERGE_THRESH: usize = 512;

/// Number of frames the buffer pool keeps resident once a backing directory is set.
pub const BP_NUM_FRAMES: usize = 256;

/// Order of the B+ trees backing the column indexes.
pub const BTREE_ORDER: usize = 75;

/// Staged entries per column before the index flushes that column into its tree.
pub const INSERT_CACHE_SIZE: usize = 50_000;

/// Pairs per `batch_insert` slice during an index flush.
pub const INDEX_BATCH_SIZE: usize = 5_000;

/// Times a conflict-aborted transaction is re-run by a worker before giving up.
pub const MAX_TRANSACTION_RETRIES: u32 = 5;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::index::Index;
use crate::record::Rid;
use crate::table::Address;

/// Snapshot of one page range for writing to disk. The live `PageRange`
/// shares its TPS with the merge worker through an atomic, which has no
/// stable serialized form; the snapshot carries the plain value instead.
#[derive(Serialize, Deserialize, Debug)]
pub struct PageRangeState {
    pub index: usize,
    pub next_base_page: usize,
    pub next_tail_page: usize,
    pub unmerged_updates: usize,
    pub tps: u64,
}

/// Everything a table needs to come back after a reload: identity, RID
/// counters, pagerange bookkeeping, the page directory, and the index with
/// its caches. Written as JSON to `<directory>/<table>/table.hdr`.
#[derive(Serialize, Deserialize)]
pub struct TableMetadata {
    pub name: String,
    pub num_columns: usize,
    pub key_column: usize,
    pub next_base_rid: u64,
    pub next_tail_rid: u64,
    pub page_ranges: Vec<PageRangeState>,
    pub page_directory: HashMap<Rid, Address>,
    pub index: Index,
}

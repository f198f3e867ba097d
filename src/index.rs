use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::btree::BPlusTree;
use crate::constants::{INDEX_BATCH_SIZE, INSERT_CACHE_SIZE};
use crate::record::{Record, Rid};

/// Per-column indexing state: one B+ tree per user column fed through a
/// write-staging cache, plus two primary-key structures that are maintained
/// synchronously and never wait on a flush.
///
/// Staging amortizes tree insertion across bulk loads: entries accumulate in
/// an append-only buffer, get sorted once at flush time, merge with whatever
/// sorted backlog exists, and go into the tree in `batch_insert` slices that
/// skip re-descent for monotonically increasing keys. Serializable with no
/// table back-reference; a rebuild takes the base records as an iterator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Index {
    num_columns: usize,

    /// One tree per user column.
    indices: Vec<BPlusTree>,

    /// Key-sorted staging backlog per column.
    insert_cache: Vec<Vec<(i64, Rid)>>,

    /// Append-only staging buffer per column; sorted once at flush time.
    unsorted_cache: Vec<Vec<(i64, Rid)>>,

    /// Largest key already promoted into each tree.
    max_keys: Vec<Option<i64>>,

    /// Primary key -> base RID, maintained synchronously with `add_record`.
    primary_key_cache: HashMap<i64, Rid>,

    /// `(pk, rid)` pairs kept ordered by binary insertion; serves PK range
    /// scans without touching (or flushing) any tree.
    sorted_records: Vec<(i64, Rid)>,
}

impl Index {
    pub fn new(num_columns: usize) -> Self {
        Index {
            num_columns,
            indices: (0..num_columns).map(|_| BPlusTree::new()).collect(),
            insert_cache: vec![Vec::new(); num_columns],
            unsorted_cache: vec![Vec::new(); num_columns],
            max_keys: vec![None; num_columns],
            primary_key_cache: HashMap::new(),
            sorted_records: Vec::new(),
        }
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    /// Stage every non-null column of `record`. The primary-key structures
    /// update immediately; column staging past the threshold flushes that
    /// column into its tree.
    pub fn add_record(&mut self, record: &Record) {
        let rid = record.rid;

        if let Some(primary_key) = record.columns.first().copied().flatten() {
            self.primary_key_cache.insert(primary_key, rid);
            let slot = self
                .sorted_records
                .partition_point(|&entry| entry < (primary_key, rid));
            self.sorted_records.insert(slot, (primary_key, rid));
        }

        for (column, key) in record.columns.iter().enumerate() {
            let Some(key) = *key else { continue };
            self.unsorted_cache[column].push((key, rid));

            if self.staged_len(column) >= INSERT_CACHE_SIZE {
                self.flush_column(column);
            }
        }
    }

    fn staged_len(&self, column: usize) -> usize {
        self.insert_cache[column].len() + self.unsorted_cache[column].len()
    }

    /// Flush every column's staging buffers into the trees.
    pub fn flush_cache(&mut self) {
        for column in 0..self.num_columns {
            self.flush_column(column);
        }
    }

    /// Flush one column: sort the unsorted buffer once, two-pointer merge it
    /// with the sorted backlog, then load the result in batches. A batch
    /// whose keys interleave below the tree maximum falls back to per-key
    /// insertion.
    fn flush_column(&mut self, column: usize) {
        if !self.unsorted_cache[column].is_empty() {
            let mut pending = std::mem::take(&mut self.unsorted_cache[column]);
            pending.sort_by_key(|&(key, _)| key);

            let backlog = std::mem::take(&mut self.insert_cache[column]);
            self.insert_cache[column] = if backlog.is_empty() {
                pending
            } else {
                merge_sorted(backlog, pending)
            };
        }

        if self.insert_cache[column].is_empty() {
            return;
        }

        let staged = std::mem::take(&mut self.insert_cache[column]);
        debug!("flushing {} staged entries for column {}", staged.len(), column);

        for batch in staged.chunks(INDEX_BATCH_SIZE) {
            if self.indices[column].batch_insert(batch).is_err() {
                for &(key, value) in batch {
                    self.indices[column].insert(key, value);
                }
            }
        }

        if let Some(&(last_key, _)) = staged.last() {
            if self.max_keys[column].map_or(true, |max| last_key > max) {
                self.max_keys[column] = Some(last_key);
            }
        }
    }

    /// Point lookup. Primary-key hits come straight from the cache; any
    /// other lookup flushes only the target column first.
    pub fn locate(&mut self, column: usize, value: i64) -> Option<Rid> {
        if column == 0 {
            if let Some(&rid) = self.primary_key_cache.get(&value) {
                return Some(rid);
            }
        }

        self.flush_column(column);
        self.indices[column].get(value).ok()
    }

    /// Inclusive range lookup. The primary-key path binary-searches
    /// `sorted_records` and never touches a tree.
    pub fn locate_range(&mut self, begin: i64, end: i64, column: usize) -> Vec<(i64, Rid)> {
        if column == 0 {
            let lo = self.sorted_records.partition_point(|&(key, _)| key < begin);
            let hi = self.sorted_records.partition_point(|&(key, _)| key <= end);
            return self.sorted_records[lo..hi].to_vec();
        }

        self.flush_column(column);
        self.indices[column].range_scan(begin, end)
    }

    /// Existence check with early returns: PK cache, then the (expected
    /// small) staging buffers, then the tree. A flush happens only when
    /// staged entries would otherwise be invisible to `has_key`.
    ///
    /// The PK cache is maintained synchronously with every `add_record`, so
    /// for column 0 its answer is definitive either way; bulk inserts never
    /// pay for a staging scan.
    pub fn exists(&mut self, column: usize, value: i64) -> bool {
        if column == 0 {
            return self.primary_key_cache.contains_key(&value);
        }

        if self.unsorted_cache[column].iter().any(|&(key, _)| key == value) {
            return true;
        }
        if self.insert_cache[column].iter().any(|&(key, _)| key == value) {
            return true;
        }

        if self.unsorted_cache[column].is_empty() && self.insert_cache[column].is_empty() {
            return self.indices[column].has_key(value);
        }

        self.flush_column(column);
        self.indices[column].has_key(value)
    }

    /// Rebuild from scratch out of the base records the caller supplies.
    /// The index holds no table reference; whoever owns the pages drives
    /// the iteration.
    pub fn rebuild<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = Record>,
    {
        *self = Index::new(self.num_columns);
        for record in records {
            self.add_record(&record);
        }
    }

    #[cfg(test)]
    pub(crate) fn tree_has_key(&self, column: usize, key: i64) -> bool {
        self.indices[column].has_key(key)
    }

    #[cfg(test)]
    pub(crate) fn pk_cache_entry(&self, key: i64) -> Option<Rid> {
        self.primary_key_cache.get(&key).copied()
    }

    #[cfg(test)]
    pub(crate) fn sorted_records_contains(&self, key: i64, rid: Rid) -> bool {
        self.sorted_records.binary_search(&(key, rid)).is_ok()
    }
}

/// Two-pointer merge of two key-sorted lists, stable toward `left`.
fn merge_sorted(left: Vec<(i64, Rid)>, right: Vec<(i64, Rid)>) -> Vec<(i64, Rid)> {
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left_iter = left.into_iter().peekable();
    let mut right_iter = right.into_iter().peekable();

    loop {
        match (left_iter.peek(), right_iter.peek()) {
            (Some(&(lk, _)), Some(&(rk, _))) => {
                if lk <= rk {
                    merged.extend(left_iter.next());
                } else {
                    merged.extend(right_iter.next());
                }
            }
            (Some(_), None) => merged.extend(left_iter.next()),
            (None, Some(_)) => merged.extend(right_iter.next()),
            (None, None) => break,
        }
    }

    merged
}

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::constants::MAX_TRANSACTION_RETRIES;
use crate::errors::DatabaseError;
use crate::lock::{global_lock_manager, LockGranularity, LockManager, LockMode, TransactionId};
use crate::table::Table;

static NEXT_TRANSACTION_ID: AtomicUsize = AtomicUsize::new(0);

/// One queued operation. Everything a query needs travels with it, so a
/// transaction can be re-run verbatim after a conflict abort.
#[derive(Clone, Debug)]
pub enum QueryOp {
    Insert {
        columns: Vec<i64>,
    },
    Update {
        key: i64,
        columns: Vec<Option<i64>>,
    },
    Delete {
        key: i64,
    },
    Select {
        key: i64,
        column: usize,
        projection: Vec<usize>,
    },
    SelectVersion {
        key: i64,
        column: usize,
        projection: Vec<usize>,
        relative_version: i64,
    },
    Sum {
        start: i64,
        end: i64,
        column: usize,
    },
    SumVersion {
        start: i64,
        end: i64,
        column: usize,
        relative_version: i64,
    },
    Increment {
        key: i64,
        column: usize,
    },
}

impl QueryOp {
    /// Insert, update and increment force the whole transaction exclusive.
    fn is_write(&self) -> bool {
        matches!(
            self,
            QueryOp::Insert { .. } | QueryOp::Update { .. } | QueryOp::Increment { .. }
        )
    }

    /// The primary key used to name the lock target. Ranged operations lock
    /// through their range start.
    fn lock_key(&self) -> Option<i64> {
        match self {
            QueryOp::Insert { .. } => None,
            QueryOp::Update { key, .. }
            | QueryOp::Delete { key }
            | QueryOp::Select { key, .. }
            | QueryOp::SelectVersion { key, .. }
            | QueryOp::Increment { key, .. } => Some(*key),
            QueryOp::Sum { start, .. } | QueryOp::SumVersion { start, .. } => Some(*start),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            QueryOp::Insert { .. } => "insert",
            QueryOp::Update { .. } => "update",
            QueryOp::Delete { .. } => "delete",
            QueryOp::Select { .. } => "select",
            QueryOp::SelectVersion { .. } => "select_version",
            QueryOp::Sum { .. } => "sum",
            QueryOp::SumVersion { .. } => "sum_version",
            QueryOp::Increment { .. } => "increment",
        }
    }
}

/// Why a transaction aborted. Duplicate keys are user error and not worth
/// retrying; everything else is contention or a missing row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    DuplicateKey,
    LockConflict,
    QueryFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    Aborted(AbortReason),
}

impl TransactionOutcome {
    pub fn committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed)
    }
}

/// A unit of concurrency-controlled work: a queue of operations, the locks
/// held so far (in acquisition order), and a change log for rollback.
/// Strict two-phase locking with no-wait conflict handling: a denied lock
/// aborts the transaction immediately.
pub struct Transaction {
    id: TransactionId,
    queries: Vec<(QueryOp, Arc<Table>)>,

    /// Insertion-ordered; released in reverse (finest first).
    held_locks: Vec<(String, LockGranularity, LockMode)>,

    /// `(table, primary key, was_insert)` per successful write, for rollback.
    changes: Vec<(Arc<Table>, i64, bool)>,

    lock_manager: Arc<LockManager>,

    /// Times this transaction has been attempted by a worker.
    pub try_count: u32,
}

impl Transaction {
    /// A transaction against the process-wide lock manager.
    pub fn new() -> Self {
        Transaction::with_lock_manager(global_lock_manager())
    }

    /// A transaction against an injected lock manager; lets every database
    /// (and every test) get its own isolated locking domain.
    pub fn with_lock_manager(lock_manager: Arc<LockManager>) -> Self {
        Transaction {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::SeqCst),
            queries: Vec::new(),
            held_locks: Vec::new(),
            changes: Vec::new(),
            lock_manager,
            try_count: 0,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn add_query(&mut self, op: QueryOp, table: &Arc<Table>) {
        self.queries.push((op, table.clone()));
    }

    /// Execute every queued operation under two-phase locking. If any
    /// operation is a write, every lock (even for reads) escalates to
    /// exclusive so a read-then-write sequence cannot lose its update.
    pub fn run(&mut self) -> TransactionOutcome {
        let overall_exclusive = self.queries.iter().any(|(op, _)| op.is_write());
        let queries = self.queries.clone();

        for (op, table) in &queries {
            let mode = if overall_exclusive || op.is_write() {
                LockMode::Exclusive
            } else {
                LockMode::Shared
            };

            let granted = match op {
                // Inserts target the table's moving last page; finer locks
                // would race, so the table lock is the whole story.
                QueryOp::Insert { .. } => self.acquire_insert_locks(table, mode),
                _ => {
                    let Some(key) = op.lock_key() else {
                        return self.abort(AbortReason::QueryFailed);
                    };
                    let Some(rid) = table.locate_rid(key) else {
                        debug!("T{} found no record for key {}", self.id, key);
                        return self.abort(AbortReason::QueryFailed);
                    };
                    match table.address_of(rid) {
                        Ok(address) => self.acquire_operation_locks(table, &address, mode),
                        Err(_) => return self.abort(AbortReason::QueryFailed),
                    }
                }
            };
            if !granted {
                return self.abort(AbortReason::LockConflict);
            }

            match execute(op, table) {
                Ok(()) => {}
                Err(DatabaseError::DuplicateKey(key)) => {
                    debug!("T{} insert collided on key {}", self.id, key);
                    return self.abort(AbortReason::DuplicateKey);
                }
                Err(error) => {
                    debug!("T{} {} failed: {}", self.id, op.name(), error);
                    return self.abort(AbortReason::QueryFailed);
                }
            }

            match op {
                QueryOp::Insert { columns } => {
                    if let Some(&key) = columns.first() {
                        self.changes.push((table.clone(), key, true));
                    }
                }
                QueryOp::Update { key, .. } | QueryOp::Increment { key, .. } => {
                    self.changes.push((table.clone(), *key, false));
                }
                _ => {}
            }
        }

        self.commit()
    }

    /// Release every lock in reverse acquisition order and succeed.
    pub fn commit(&mut self) -> TransactionOutcome {
        self.release_all();
        self.changes.clear();
        TransactionOutcome::Committed
    }

    /// Replay the change log backwards (inserts are undone with a delete;
    /// updates stay, their exclusive locks having kept them unobserved),
    /// then release every lock. Rollback failures are logged, never raised:
    /// the release phase must always run.
    pub fn abort(&mut self, reason: AbortReason) -> TransactionOutcome {
        for (table, key, was_insert) in self.changes.drain(..).rev() {
            if was_insert {
                if let Err(error) = table.delete(key) {
                    warn!(
                        "T{} rollback delete of key {} failed: {}",
                        self.id, key, error
                    );
                }
            }
        }

        self.release_all();
        debug!("T{} aborted: {:?}", self.id, reason);
        TransactionOutcome::Aborted(reason)
    }

    fn release_all(&mut self) {
        for (lock_id, _, _) in self.held_locks.iter().rev() {
            self.lock_manager.release(self.id, lock_id);
        }
        self.held_locks.clear();
    }

    fn acquire_insert_locks(&mut self, table: &Table, mode: LockMode) -> bool {
        self.acquire(table.name.clone(), LockGranularity::Table, mode)
    }

    fn acquire_operation_locks(
        &mut self,
        table: &Table,
        address: &crate::table::Address,
        mode: LockMode,
    ) -> bool {
        for (lock_id, granularity) in table.lock_ids(address) {
            if !self.acquire(lock_id, granularity, mode) {
                return false;
            }
        }
        true
    }

    fn acquire(&mut self, lock_id: String, granularity: LockGranularity, mode: LockMode) -> bool {
        if !self.lock_manager.acquire(self.id, &lock_id, mode, granularity) {
            debug!(
                "T{} gave up: {}",
                self.id,
                DatabaseError::LockConflict(lock_id)
            );
            return false;
        }

        if !self.held_locks.iter().any(|(held, _, _)| *held == lock_id) {
            self.held_locks.push((lock_id, granularity, mode));
        }
        true
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}

fn execute(op: &QueryOp, table: &Table) -> Result<(), DatabaseError> {
    match op {
        QueryOp::Insert { columns } => table.insert(columns.clone()),
        QueryOp::Update { key, columns } => table.update(*key, columns.clone()),
        QueryOp::Delete { key } => table.delete(*key),
        QueryOp::Select {
            key,
            column,
            projection,
        } => table.select(*key, *column, projection).map(|_| ()),
        QueryOp::SelectVersion {
            key,
            column,
            projection,
            relative_version,
        } => table
            .select_version(*key, *column, projection, *relative_version)
            .map(|_| ()),
        QueryOp::Sum { start, end, column } => table.sum(*start, *end, *column).map(|_| ()),
        QueryOp::SumVersion {
            start,
            end,
            column,
            relative_version,
        } => table
            .sum_version(*start, *end, *column, *relative_version)
            .map(|_| ()),
        QueryOp::Increment { key, column } => table.increment(*key, *column),
    }
}

/// Runs a batch of transactions on its own thread, the way a driver feeds
/// the engine. Conflict aborts are retried (the no-wait protocol makes them
/// routine); duplicate-key aborts are user error and are dropped.
pub struct TransactionWorker {
    transactions: Vec<Transaction>,
    handle: Option<JoinHandle<usize>>,
}

impl TransactionWorker {
    pub fn new() -> Self {
        TransactionWorker {
            transactions: Vec::new(),
            handle: None,
        }
    }

    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    /// Spawn the worker thread. The thread drains the queue, requeueing
    /// conflict-aborted transactions until they commit or exhaust their
    /// retries, and finally reports how many committed.
    pub fn run(&mut self) {
        let transactions = std::mem::take(&mut self.transactions);

        self.handle = Some(thread::spawn(move || {
            let mut committed = 0;
            let mut queue: VecDeque<Transaction> = transactions.into();

            while let Some(mut transaction) = queue.pop_front() {
                match transaction.run() {
                    TransactionOutcome::Committed => committed += 1,
                    TransactionOutcome::Aborted(AbortReason::DuplicateKey) => {
                        debug!("T{} dropped: duplicate key", transaction.id());
                    }
                    TransactionOutcome::Aborted(_) => {
                        transaction.try_count += 1;
                        if transaction.try_count < MAX_TRANSACTION_RETRIES {
                            queue.push_back(transaction);
                        } else {
                            warn!(
                                "T{} gave up after {} attempts",
                                transaction.id(),
                                transaction.try_count
                            );
                        }
                    }
                }
            }

            committed
        }));
    }

    /// Wait for the worker and return the number of committed transactions.
    pub fn join(&mut self) -> usize {
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(0),
            None => 0,
        }
    }
}

impl Default for TransactionWorker {
    fn default() -> Self {
        TransactionWorker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufferpool::BufferPool;

    fn scratch_table() -> Arc<Table> {
        Arc::new(Table::new("grades", 3, 0, Arc::new(BufferPool::new())))
    }

    #[test]
    fn a_transaction_commits_its_queue_in_order() {
        let table = scratch_table();
        let manager = Arc::new(LockManager::new());

        let mut transaction = Transaction::with_lock_manager(manager.clone());
        transaction.add_query(
            QueryOp::Insert {
                columns: vec![1, 10, 20],
            },
            &table,
        );
        transaction.add_query(
            QueryOp::Update {
                key: 1,
                columns: vec![None, Some(99), None],
            },
            &table,
        );
        transaction.add_query(
            QueryOp::Select {
                key: 1,
                column: 0,
                projection: vec![1, 1, 1],
            },
            &table,
        );

        assert!(transaction.run().committed());
        assert!(!manager.is_locked("grades"));

        let records = table.select(1, 0, &[1, 1, 1]).unwrap();
        assert_eq!(records[0].columns, vec![Some(1), Some(99), Some(20)]);
    }

    #[test]
    fn duplicate_insert_aborts_with_the_dedicated_reason() {
        let table = scratch_table();
        table.insert(vec![1, 10, 20]).unwrap();

        let mut transaction = Transaction::with_lock_manager(Arc::new(LockManager::new()));
        transaction.add_query(
            QueryOp::Insert {
                columns: vec![1, 0, 0],
            },
            &table,
        );

        assert_eq!(
            transaction.run(),
            TransactionOutcome::Aborted(AbortReason::DuplicateKey)
        );
    }

    #[test]
    fn missing_key_aborts_before_any_lock_is_taken() {
        let table = scratch_table();
        let manager = Arc::new(LockManager::new());

        let mut transaction = Transaction::with_lock_manager(manager.clone());
        transaction.add_query(
            QueryOp::Update {
                key: 404,
                columns: vec![None, Some(1), None],
            },
            &table,
        );

        assert_eq!(
            transaction.run(),
            TransactionOutcome::Aborted(AbortReason::QueryFailed)
        );
        assert!(!manager.is_locked("grades"));
    }

    #[test]
    fn conflicting_transactions_abort_and_release() {
        let table = scratch_table();
        table.insert(vec![1, 10, 20]).unwrap();
        let manager = Arc::new(LockManager::new());

        // A rival holds the record exclusively, as a running write
        // transaction would.
        let rival: TransactionId = 9_999;
        let rid = table.locate_rid(1).unwrap();
        let address = table.address_of(rid).unwrap();
        for (lock_id, granularity) in table.lock_ids(&address) {
            assert!(manager.acquire(rival, &lock_id, LockMode::Exclusive, granularity));
        }

        let mut transaction = Transaction::with_lock_manager(manager.clone());
        transaction.add_query(
            QueryOp::Update {
                key: 1,
                columns: vec![None, Some(99), None],
            },
            &table,
        );
        assert_eq!(
            transaction.run(),
            TransactionOutcome::Aborted(AbortReason::LockConflict)
        );

        // After the rival finishes, the same transaction goes through.
        for (lock_id, _) in table.lock_ids(&address) {
            manager.release(rival, &lock_id);
        }
        assert!(transaction.run().committed());
        assert!(!manager.is_locked("grades"));

        let records = table.select(1, 0, &[1, 1, 1]).unwrap();
        assert_eq!(records[0].columns, vec![Some(1), Some(99), Some(20)]);
    }

    #[test]
    fn aborted_inserts_are_rolled_back() {
        let table = scratch_table();
        table.insert(vec![5, 50, 500]).unwrap();
        let manager = Arc::new(LockManager::new());

        // The second operation conflicts, so the first (a successful
        // insert) must be tombstoned during rollback.
        let rival: TransactionId = 9_999;
        let rid = table.locate_rid(5).unwrap();
        let address = table.address_of(rid).unwrap();
        let record_lock = table.lock_ids(&address)[3].0.clone();
        assert!(manager.acquire(rival, &record_lock, LockMode::Exclusive, LockGranularity::Record));

        let mut transaction = Transaction::with_lock_manager(manager.clone());
        transaction.add_query(
            QueryOp::Insert {
                columns: vec![2, 20, 200],
            },
            &table,
        );
        transaction.add_query(
            QueryOp::Update {
                key: 5,
                columns: vec![None, Some(51), None],
            },
            &table,
        );

        assert_eq!(
            transaction.run(),
            TransactionOutcome::Aborted(AbortReason::LockConflict)
        );

        // The rolled-back insert reads as a tombstone.
        let records = table.select(2, 0, &[1, 1, 1]).unwrap();
        assert_eq!(records[0].columns, vec![None, None, None]);
    }

    #[test]
    fn read_only_transactions_share_locks() {
        let table = scratch_table();
        table.insert(vec![1, 10, 20]).unwrap();
        let manager = Arc::new(LockManager::new());

        // A rival reader holds shared locks on the same record.
        let rival: TransactionId = 9_999;
        let rid = table.locate_rid(1).unwrap();
        let address = table.address_of(rid).unwrap();
        for (lock_id, granularity) in table.lock_ids(&address) {
            assert!(manager.acquire(rival, &lock_id, LockMode::Shared, granularity));
        }

        let mut reader = Transaction::with_lock_manager(manager.clone());
        reader.add_query(
            QueryOp::Select {
                key: 1,
                column: 0,
                projection: vec![1, 1, 1],
            },
            &table,
        );
        assert!(reader.run().committed());
    }

    #[test]
    fn worker_retries_conflicts_until_they_commit() {
        let table = scratch_table();
        table.insert(vec![1, 10, 20]).unwrap();
        let manager = Arc::new(LockManager::new());

        let mut first = Transaction::with_lock_manager(manager.clone());
        first.add_query(
            QueryOp::Update {
                key: 1,
                columns: vec![None, Some(30), None],
            },
            &table,
        );
        let mut second = Transaction::with_lock_manager(manager.clone());
        second.add_query(
            QueryOp::Increment { key: 1, column: 1 },
            &table,
        );

        let mut worker = TransactionWorker::new();
        worker.add_transaction(first);
        worker.add_transaction(second);
        worker.run();
        assert_eq!(worker.join(), 2);

        let records = table.select(1, 0, &[1, 1, 1]).unwrap();
        assert_eq!(records[0].columns, vec![Some(1), Some(31), Some(20)]);
    }
}

//! An in-process columnar OLTP storage engine organized as a two-layer
//! L-Store: immutable base records accumulate append-only tail deltas, a
//! background worker periodically folds tails back into the base lane, and
//! strict two-phase locking with no-wait conflict handling keeps concurrent
//! transactions conflict-serializable.
//!
//! Entry points: [`database::Database`] for the catalog, [`table::Table`]
//! for queries, [`transaction::Transaction`] and
//! [`transaction::TransactionWorker`] for concurrency-controlled execution.

pub mod btree;
pub mod bufferpool;
pub mod constants;
pub mod database;
pub mod errors;
pub mod index;
pub mod lock;
pub mod page;
pub mod persistables;
pub mod record;
pub mod table;
pub mod transaction;

pub use bufferpool::BufferPool;
pub use database::Database;
pub use errors::DatabaseError;
pub use index::Index;
pub use lock::{LockGranularity, LockManager, LockMode};
pub use record::{Record, Rid};
pub use table::Table;
pub use transaction::{QueryOp, Transaction, TransactionOutcome, TransactionWorker};

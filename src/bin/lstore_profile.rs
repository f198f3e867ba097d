use rand::prelude::*;

use lstore_rs::transaction::QueryOp;
use lstore_rs::{Database, Transaction, TransactionWorker};

use std::collections::HashSet;
use std::time::Instant;

const NUM_COLUMNS: usize = 8;
const OPERATIONS: usize = 250_000;

fn main() {
    env_logger::init();

    let database = Database::new();
    let table = database.create_table("prof_tbl", NUM_COLUMNS, 0);
    let mut rng = rand::thread_rng();
    let mut primary_keys: HashSet<i64> = HashSet::new();

    let started = Instant::now();
    let mut inserted = 0usize;
    let mut updated = 0usize;
    let mut selected = 0usize;

    for _ in 0..OPERATIONS {
        match rng.gen_range(0..3) {
            0 => {
                let row: Vec<i64> = (0..NUM_COLUMNS)
                    .map(|_| rng.gen_range(1..=100_000))
                    .collect();

                if primary_keys.insert(row[0]) && table.insert(row).is_ok() {
                    inserted += 1;
                }
            }

            1 => {
                let row: Vec<Option<i64>> = (0..NUM_COLUMNS)
                    .map(|_| Some(rng.gen_range(1..=100_000)))
                    .collect();

                let key = rng.gen_range(1..=100_000);
                if primary_keys.contains(&key) && table.update(key, row).is_ok() {
                    updated += 1;
                }
            }

            _ => {
                let projection: Vec<usize> =
                    (0..NUM_COLUMNS).map(|_| rng.gen_range(0..=1)).collect();

                let key = rng.gen_range(1..=100_000);
                if primary_keys.contains(&key) && table.select(key, 0, &projection).is_ok() {
                    selected += 1;
                }
            }
        }
    }

    println!(
        "mixed workload: {} inserts, {} updates, {} selects in {:?}",
        inserted,
        updated,
        selected,
        started.elapsed()
    );

    // The same workload shape again, but through worker-driven transactions.
    let started = Instant::now();
    let mut worker = TransactionWorker::new();
    for key in 200_000..201_000 {
        let mut transaction = Transaction::with_lock_manager(database.lock_manager());
        transaction.add_query(
            QueryOp::Insert {
                columns: (0..NUM_COLUMNS as i64).map(|c| key + c).collect(),
            },
            &table,
        );
        transaction.add_query(QueryOp::Increment { key, column: 1 }, &table);
        worker.add_transaction(transaction);
    }
    worker.run();
    let committed = worker.join();

    println!(
        "transactional workload: {} of 1000 committed in {:?}",
        committed,
        started.elapsed()
    );
}

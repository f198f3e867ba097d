use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use log::debug;
use once_cell::sync::Lazy;

/// Identifies a running transaction.
pub type TransactionId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Hierarchy levels, coarsest first. Lock IDs are path-like strings, so the
/// granularity mostly matters for diagnostics and release ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockGranularity {
    Table,
    PageRange,
    Page,
    Record,
}

impl fmt::Display for LockGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockGranularity::Table => "table",
            LockGranularity::PageRange => "pagerange",
            LockGranularity::Page => "page",
            LockGranularity::Record => "record",
        };
        write!(f, "{}", name)
    }
}

struct LockEntry {
    mode: LockMode,
    holders: HashSet<TransactionId>,
}

/// No-wait two-phase lock manager. `acquire` answers immediately: a denied
/// request never queues, the requesting transaction aborts instead, which
/// rules out deadlock. One mutex covers lookup and mutation of the table.
pub struct LockManager {
    table: Mutex<HashMap<String, LockEntry>>,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take `lock_id` in `mode` for `tx`. Grants are re-entrant; a
    /// sole shared holder may upgrade to exclusive.
    pub fn acquire(
        &self,
        tx: TransactionId,
        lock_id: &str,
        mode: LockMode,
        granularity: LockGranularity,
    ) -> bool {
        let mut table = self.table.lock().unwrap();

        let granted = match table.get_mut(lock_id) {
            None => {
                table.insert(
                    lock_id.to_string(),
                    LockEntry {
                        mode,
                        holders: HashSet::from([tx]),
                    },
                );
                true
            }
            Some(entry) => {
                if entry.holders.contains(&tx) {
                    if mode == LockMode::Exclusive && entry.mode == LockMode::Shared {
                        // Upgrade only when nobody else shares the lock.
                        if entry.holders.len() == 1 {
                            entry.mode = LockMode::Exclusive;
                            true
                        } else {
                            false
                        }
                    } else {
                        true
                    }
                } else if entry.mode == LockMode::Shared && mode == LockMode::Shared {
                    entry.holders.insert(tx);
                    true
                } else {
                    false
                }
            }
        };

        if !granted {
            debug!(
                "T{} denied {:?} {} lock on {}",
                tx, mode, granularity, lock_id
            );
        }

        granted
    }

    /// Drop `tx` from the holders of `lock_id`; the row disappears once the
    /// last holder leaves.
    pub fn release(&self, tx: TransactionId, lock_id: &str) {
        let mut table = self.table.lock().unwrap();

        if let Some(entry) = table.get_mut(lock_id) {
            entry.holders.remove(&tx);
            if entry.holders.is_empty() {
                table.remove(lock_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self, lock_id: &str) -> bool {
        self.table.lock().unwrap().contains_key(lock_id)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new()
    }
}

static GLOBAL_LOCK_MANAGER: Lazy<Arc<LockManager>> = Lazy::new(|| Arc::new(LockManager::new()));

/// Process-wide lock manager used by transactions that were not handed a
/// database-scoped one.
pub fn global_lock_manager() -> Arc<LockManager> {
    GLOBAL_LOCK_MANAGER.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_coexist() {
        let manager = LockManager::new();
        assert!(manager.acquire(1, "grades", LockMode::Shared, LockGranularity::Table));
        assert!(manager.acquire(2, "grades", LockMode::Shared, LockGranularity::Table));
    }

    #[test]
    fn exclusive_locks_conflict_both_ways() {
        let manager = LockManager::new();
        assert!(manager.acquire(1, "grades", LockMode::Exclusive, LockGranularity::Table));
        assert!(!manager.acquire(2, "grades", LockMode::Shared, LockGranularity::Table));
        assert!(!manager.acquire(2, "grades", LockMode::Exclusive, LockGranularity::Table));

        let manager = LockManager::new();
        assert!(manager.acquire(1, "grades", LockMode::Shared, LockGranularity::Table));
        assert!(!manager.acquire(2, "grades", LockMode::Exclusive, LockGranularity::Table));
    }

    #[test]
    fn reacquisition_by_the_holder_is_granted() {
        let manager = LockManager::new();
        assert!(manager.acquire(1, "grades", LockMode::Exclusive, LockGranularity::Table));
        assert!(manager.acquire(1, "grades", LockMode::Exclusive, LockGranularity::Table));
        assert!(manager.acquire(1, "grades", LockMode::Shared, LockGranularity::Table));
    }

    #[test]
    fn sole_holder_upgrades_shared_to_exclusive() {
        let manager = LockManager::new();
        assert!(manager.acquire(1, "grades", LockMode::Shared, LockGranularity::Table));
        assert!(manager.acquire(1, "grades", LockMode::Exclusive, LockGranularity::Table));
        assert!(!manager.acquire(2, "grades", LockMode::Shared, LockGranularity::Table));
    }

    #[test]
    fn upgrade_is_denied_while_the_lock_is_shared() {
        let manager = LockManager::new();
        assert!(manager.acquire(1, "grades", LockMode::Shared, LockGranularity::Table));
        assert!(manager.acquire(2, "grades", LockMode::Shared, LockGranularity::Table));
        assert!(!manager.acquire(1, "grades", LockMode::Exclusive, LockGranularity::Table));
    }

    #[test]
    fn release_frees_the_row_once_the_last_holder_leaves() {
        let manager = LockManager::new();
        manager.acquire(1, "grades", LockMode::Shared, LockGranularity::Table);
        manager.acquire(2, "grades", LockMode::Shared, LockGranularity::Table);

        manager.release(1, "grades");
        assert!(manager.is_locked("grades"));
        assert!(!manager.acquire(3, "grades", LockMode::Exclusive, LockGranularity::Table));

        manager.release(2, "grades");
        assert!(!manager.is_locked("grades"));
        assert!(manager.acquire(3, "grades", LockMode::Exclusive, LockGranularity::Table));
    }

    #[test]
    fn hierarchical_ids_lock_independently() {
        let manager = LockManager::new();
        assert!(manager.acquire(
            1,
            "grades/pagerange_0/base/page_0/3",
            LockMode::Exclusive,
            LockGranularity::Record
        ));
        // A different record on the same page is not blocked.
        assert!(manager.acquire(
            2,
            "grades/pagerange_0/base/page_0/4",
            LockMode::Exclusive,
            LockGranularity::Record
        ));
    }
}

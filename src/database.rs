use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::bufferpool::BufferPool;
use crate::errors::DatabaseError;
use crate::lock::LockManager;
use crate::table::Table;

/// Catalog of tables sharing one buffer pool and one lock manager. Without
/// a working directory the database is purely in-memory; `open` attaches a
/// directory, after which `close` persists every table and `get_table` can
/// reload tables a previous process wrote.
pub struct Database {
    directory: Option<PathBuf>,
    tables: Mutex<HashMap<String, Arc<Table>>>,
    bufferpool: Arc<BufferPool>,
    lock_manager: Arc<LockManager>,
}

impl Database {
    pub fn new() -> Self {
        Database {
            directory: None,
            tables: Mutex::new(HashMap::new()),
            bufferpool: Arc::new(BufferPool::new()),
            lock_manager: Arc::new(LockManager::new()),
        }
    }

    /// Attach a working directory for persistence.
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<(), DatabaseError> {
        let path = path.as_ref();
        fs::create_dir_all(path)?;
        self.bufferpool.set_directory(path);
        self.directory = Some(path.to_path_buf());
        Ok(())
    }

    /// Persist every table's metadata and flush dirty pages. A database
    /// that was never `open`ed has nowhere to write and does nothing.
    pub fn close(&self) -> Result<(), DatabaseError> {
        let Some(directory) = &self.directory else {
            debug!("close on an in-memory database is a no-op");
            return Ok(());
        };

        for table in self.tables.lock().unwrap().values() {
            table.persist(directory)?;
        }
        self.bufferpool.flush()
    }

    /// Create a table. `key_index` names the primary-key column (0 in every
    /// schema this engine serves).
    pub fn create_table(
        &self,
        name: &str,
        num_columns: usize,
        key_index: usize,
    ) -> Arc<Table> {
        let table = Arc::new(Table::new(name, num_columns, key_index, self.bufferpool.clone()));
        self.tables
            .lock()
            .unwrap()
            .insert(name.to_string(), table.clone());
        table
    }

    /// Fetch a table by name, reloading it from the working directory when
    /// it is not live in this process.
    pub fn get_table(&self, name: &str) -> Result<Arc<Table>, DatabaseError> {
        if let Some(table) = self.tables.lock().unwrap().get(name) {
            return Ok(table.clone());
        }

        let directory = self
            .directory
            .as_ref()
            .ok_or_else(|| DatabaseError::NoSuchTable(name.to_string()))?;
        let table = Arc::new(Table::load(directory, name, self.bufferpool.clone())?);
        self.tables
            .lock()
            .unwrap()
            .insert(name.to_string(), table.clone());
        Ok(table)
    }

    /// Drop a table from the catalog and, when persisted, from disk.
    pub fn drop_table(&self, name: &str) {
        self.tables.lock().unwrap().remove(name);

        if let Some(directory) = &self.directory {
            if let Err(error) = fs::remove_dir_all(directory.join(name)) {
                warn!("could not remove files of dropped table {}: {}", name, error);
            }
        }
    }

    /// The lock manager transactions against this database should use.
    pub fn lock_manager(&self) -> Arc<LockManager> {
        self.lock_manager.clone()
    }
}

impl Default for Database {
    fn default() -> Self {
        Database::new()
    }
}

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, warn};

use crate::constants::BP_NUM_FRAMES;
use crate::errors::DatabaseError;
use crate::page::Page;

/// One resident page plus its cache bookkeeping.
struct Frame {
    page: Arc<RwLock<Page>>,
    pin_count: usize,
    dirty: bool,
}

/// Path-keyed frame cache shared by every table in a database. Pages are
/// handed out as live references; `PageHandle` unpins on drop so early
/// returns cannot leak pins. With a backing directory set, missing pages
/// fault in from disk and dirty frames write back on flush or eviction;
/// without one the pool is purely in-memory and never evicts.
pub struct BufferPool {
    frames: Mutex<HashMap<String, Frame>>,
    directory: Mutex<Option<PathBuf>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool::with_capacity(BP_NUM_FRAMES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        BufferPool {
            frames: Mutex::new(HashMap::new()),
            directory: Mutex::new(None),
            capacity,
        }
    }

    /// Point the pool at a backing directory. The on-disk layout mirrors the
    /// logical `<table>/pagerange_<P>/<base|tail>/page_<N>` paths.
    pub fn set_directory(&self, directory: &Path) {
        *self.directory.lock().unwrap() = Some(directory.to_path_buf());
    }

    /// Register a freshly created page. The frame starts dirty: it has no
    /// backing file until the next flush.
    pub fn add_frame(&self, path: &str, page: Page) {
        let mut frames = self.frames.lock().unwrap();
        self.evict_if_needed(&mut frames);
        frames.insert(
            path.to_string(),
            Frame {
                page: Arc::new(RwLock::new(page)),
                pin_count: 0,
                dirty: true,
            },
        );
    }

    /// Fetch (and pin) a page. Faults in from the backing directory when the
    /// page is not resident.
    pub fn get_page(&self, path: &str) -> Result<PageHandle<'_>, DatabaseError> {
        let mut frames = self.frames.lock().unwrap();

        if let Some(frame) = frames.get_mut(path) {
            frame.pin_count += 1;
            return Ok(PageHandle {
                pool: self,
                path: path.to_string(),
                page: frame.page.clone(),
            });
        }

        let backing = self.directory.lock().unwrap().clone();
        let directory = backing.ok_or_else(|| DatabaseError::PageMiss(path.to_string()))?;
        let data = fs::read_to_string(directory.join(path))
            .map_err(|_| DatabaseError::PageMiss(path.to_string()))?;
        let page: Page =
            serde_json::from_str(&data).map_err(|error| DatabaseError::Io(error.to_string()))?;
        debug!("faulted in page {}", path);

        self.evict_if_needed(&mut frames);
        let page = Arc::new(RwLock::new(page));
        frames.insert(
            path.to_string(),
            Frame {
                page: page.clone(),
                pin_count: 1,
                dirty: false,
            },
        );

        Ok(PageHandle {
            pool: self,
            path: path.to_string(),
            page,
        })
    }

    /// Drop one pin. Callers normally let `PageHandle` do this.
    pub fn unpin_page(&self, path: &str) {
        let mut frames = self.frames.lock().unwrap();
        if let Some(frame) = frames.get_mut(path) {
            frame.pin_count = frame.pin_count.saturating_sub(1);
        }
    }

    pub fn mark_dirty(&self, path: &str) {
        let mut frames = self.frames.lock().unwrap();
        if let Some(frame) = frames.get_mut(path) {
            frame.dirty = true;
        }
    }

    /// Write every dirty frame to the backing directory. A pool without a
    /// directory has nothing durable to do.
    pub fn flush(&self) -> Result<(), DatabaseError> {
        let directory = self.directory.lock().unwrap().clone();
        let Some(directory) = directory else {
            debug!("flush requested on an in-memory buffer pool");
            return Ok(());
        };

        let mut frames = self.frames.lock().unwrap();
        for (path, frame) in frames.iter_mut() {
            if frame.dirty {
                write_back(&directory, path, &frame.page.read().unwrap())?;
                frame.dirty = false;
            }
        }

        Ok(())
    }

    /// Evict one unpinned frame when the pool is over capacity. Only legal
    /// with a backing directory; an in-memory pool owns the sole copy.
    fn evict_if_needed(&self, frames: &mut HashMap<String, Frame>) {
        if frames.len() < self.capacity {
            return;
        }

        let directory = self.directory.lock().unwrap().clone();
        let Some(directory) = directory else {
            return;
        };

        let victim = frames
            .iter()
            .find(|(_, frame)| frame.pin_count == 0)
            .map(|(path, _)| path.clone());

        match victim {
            Some(path) => {
                if let Some(frame) = frames.remove(&path) {
                    // Victims are always written back; a frame created via
                    // add_frame may have no backing file yet even when clean.
                    let write_result = {
                        let guard = frame.page.read().unwrap();
                        write_back(&directory, &path, &guard)
                    };
                    if let Err(error) = write_result {
                        warn!("write-back of evicted page {} failed: {}", path, error);
                        frames.insert(path, frame);
                        return;
                    }
                    debug!("evicted page {}", path);
                }
            }
            None => debug!("buffer pool over capacity but every frame is pinned"),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new()
    }
}

fn write_back(directory: &Path, path: &str, page: &Page) -> Result<(), DatabaseError> {
    let file = directory.join(path);
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }

    let data = serde_json::to_string(page).map_err(|error| DatabaseError::Io(error.to_string()))?;
    fs::write(file, data)?;
    Ok(())
}

/// A pinned page. Unpins itself when dropped.
pub struct PageHandle<'a> {
    pool: &'a BufferPool,
    path: String,
    page: Arc<RwLock<Page>>,
}

impl std::fmt::Debug for PageHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle").field("path", &self.path).finish()
    }
}

impl PageHandle<'_> {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write().unwrap()
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        self.pool.unpin_page(&self.path);
    }
}

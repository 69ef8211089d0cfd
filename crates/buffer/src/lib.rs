//! Buffer pool manager sitting between the columnar storage layer and disk.
//!
//! Maps a 5-tuple page identifier ([`PageKey`]) to a resident [`Page`],
//! evicting by classic LRU order while honoring pin counts: a pinned page is
//! never evicted, and if every resident page happens to be pinned the pool
//! grows its soft capacity by one rather than failing.
//!
//! # Example
//!
//! ```no_run
//! use buffer::BufferPool;
//! use common::PageKey;
//! use std::sync::Arc;
//!
//! let pool = BufferPool::new("/tmp/db", 100);
//! let key = PageKey::new(Arc::from("orders"), 0, false, 0, 0);
//!
//! let page = pool.get_page(&key).unwrap();
//! page.lock().unwrap().write_at(0, 42).unwrap();
//! pool.mark_dirty(&key);
//! pool.unpin(&key);
//!
//! pool.flush_all().unwrap();
//! ```

#[cfg(test)]
mod tests;

use common::{DbError, DbResult, PageKey};
use log::warn;
use lru::LruCache;
use page::Page;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Shared, lockable handle to a resident page. Serializes concurrent writers
/// at page granularity, which is the synchronization primitive the merge
/// worker and request handlers rely on to avoid torn writes to the same
/// base page.
pub type PageHandle = Arc<Mutex<Page>>;

/// Capability surface of a page-resident store, mirroring the teacher's own
/// `buffer::Pager` trait over its `FilePager`. `BufferPool` is the sole
/// implementation in this workspace; the trait documents the seam a mock or
/// an alternative eviction policy would plug into.
pub trait PageStore {
    fn get_page(&self, key: &PageKey) -> DbResult<PageHandle>;
    fn read_value(&self, key: &PageKey, slot: usize) -> DbResult<i64>;
    fn mark_dirty(&self, key: &PageKey);
    fn unpin(&self, key: &PageKey);
    fn flush_all(&self) -> DbResult<()>;
}

struct Frame {
    page: PageHandle,
    dirty: bool,
    pin_count: u32,
}

struct Inner {
    frames: LruCache<PageKey, Frame>,
    capacity: usize,
    made_dirs: HashSet<PathBuf>,
}

/// File-backed buffer pool with pin-aware LRU eviction.
///
/// One file per page, under `<db_path>/<table>/page_range_<R>/{base|tail}_<page>_<col>.page`.
pub struct BufferPool {
    db_path: PathBuf,
    inner: Mutex<Inner>,
}

impl BufferPool {
    /// `capacity` is a soft cap: it starts here but may grow if every
    /// resident page is pinned at eviction time.
    pub fn new(db_path: impl Into<PathBuf>, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer pool capacity must be > 0");
        Self {
            db_path: db_path.into(),
            inner: Mutex::new(Inner {
                frames: LruCache::unbounded(),
                capacity,
                made_dirs: HashSet::new(),
            }),
        }
    }

    /// Current soft capacity, including any growth from pinned-out evictions.
    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Number of pages currently resident.
    pub fn resident_count(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    fn file_path(&self, key: &PageKey) -> PathBuf {
        self.db_path.join(key.relative_path())
    }

    fn load_from_disk(&self, key: &PageKey) -> DbResult<Page> {
        match fs::read(self.file_path(key)) {
            Ok(bytes) => Page::from_bytes(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Page::new()),
            Err(e) => Err(DbError::Io(e)),
        }
    }

    fn flush_frame(&self, inner: &mut Inner, key: &PageKey, frame: &Frame) -> DbResult<()> {
        let path = self.file_path(key);
        if let Some(dir) = path.parent()
            && inner.made_dirs.insert(dir.to_path_buf())
        {
            fs::create_dir_all(dir)?;
        }
        let bytes = frame.page.lock().unwrap().to_bytes();
        fs::write(&path, bytes)?;
        Ok(())
    }

    /// Scans resident frames in LRU order for the first with a zero pin
    /// count, flushing it first if dirty, then evicts it. If every resident
    /// frame is pinned, grows capacity by one instead (logged) so callers
    /// always make forward progress.
    fn evict_one(&self, inner: &mut Inner) -> DbResult<()> {
        let victim = inner
            .frames
            .iter()
            .rev()
            .find(|(_, frame)| frame.pin_count == 0)
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                let frame = inner.frames.pop(&key).expect("victim observed above");
                if frame.dirty {
                    self.flush_frame(inner, &key, &frame)?;
                }
                Ok(())
            }
            None => {
                inner.capacity += 1;
                warn!(
                    "buffer pool: all {} resident pages are pinned, growing capacity to {}",
                    inner.frames.len(),
                    inner.capacity
                );
                Ok(())
            }
        }
    }

    fn ensure_room(&self, inner: &mut Inner) -> DbResult<()> {
        loop {
            if inner.frames.len() < inner.capacity {
                return Ok(());
            }
            let capacity_before = inner.capacity;
            self.evict_one(inner)?;
            if inner.capacity != capacity_before {
                // Soft grow already made room for one more resident frame.
                return Ok(());
            }
        }
    }

    /// If resident, promotes to MRU and increments the pin count. Otherwise
    /// loads from disk (a missing file materializes an empty page), evicts
    /// until there is room, and inserts pinned at MRU.
    pub fn get_page(&self, key: &PageKey) -> DbResult<PageHandle> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(frame) = inner.frames.get_mut(key) {
            frame.pin_count += 1;
            return Ok(frame.page.clone());
        }
        let page = self.load_from_disk(key)?;
        self.ensure_room(&mut inner)?;
        let handle: PageHandle = Arc::new(Mutex::new(page));
        inner.frames.put(
            key.clone(),
            Frame {
                page: handle.clone(),
                dirty: false,
                pin_count: 1,
            },
        );
        Ok(handle)
    }

    /// Reads a single slot. Fast path: if `key` is already resident, reads
    /// directly without touching pin count or LRU order. Otherwise behaves
    /// as `get_page` + read + `unpin`.
    pub fn read_value(&self, key: &PageKey, slot: usize) -> DbResult<i64> {
        {
            let inner = self.inner.lock().unwrap();
            if let Some(frame) = inner.frames.peek(key) {
                return Ok(frame.page.lock().unwrap().read(slot));
            }
        }
        let handle = self.get_page(key)?;
        let value = handle.lock().unwrap().read(slot);
        self.unpin(key);
        Ok(value)
    }

    /// Marks a resident page dirty. No-op if the key is not resident (it was
    /// evicted out from under the caller, which should not happen while
    /// pinned).
    pub fn mark_dirty(&self, key: &PageKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(frame) = inner.frames.peek_mut(key) {
            frame.dirty = true;
        }
    }

    /// Decrements the pin count; once it reaches zero the page becomes
    /// evictable again.
    pub fn unpin(&self, key: &PageKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(frame) = inner.frames.peek_mut(key) {
            frame.pin_count = frame.pin_count.saturating_sub(1);
        }
    }

    /// Writes every dirty resident page to disk and clears their dirty bits.
    /// Pin state is irrelevant to flushing.
    pub fn flush_all(&self) -> DbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let dirty_keys: Vec<PageKey> = inner
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty)
            .map(|(key, _)| key.clone())
            .collect();
        for key in dirty_keys {
            let bytes = {
                let frame = inner.frames.peek(&key).expect("key collected above");
                frame.page.lock().unwrap().to_bytes()
            };
            let path = self.file_path(&key);
            if let Some(dir) = path.parent()
                && inner.made_dirs.insert(dir.to_path_buf())
            {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, bytes)?;
            if let Some(frame) = inner.frames.peek_mut(&key) {
                frame.dirty = false;
            }
        }
        Ok(())
    }
}

impl PageStore for BufferPool {
    fn get_page(&self, key: &PageKey) -> DbResult<PageHandle> {
        self.get_page(key)
    }

    fn read_value(&self, key: &PageKey, slot: usize) -> DbResult<i64> {
        self.read_value(key, slot)
    }

    fn mark_dirty(&self, key: &PageKey) {
        self.mark_dirty(key)
    }

    fn unpin(&self, key: &PageKey) {
        self.unpin(key)
    }

    fn flush_all(&self) -> DbResult<()> {
        self.flush_all()
    }
}

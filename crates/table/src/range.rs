//! A contiguous block of up to `RECORDS_PER_PAGE_RANGE` base records, plus
//! however many tail records have accumulated against them.
//!
//! All column reads and writes are routed through the shared [`BufferPool`];
//! `PageRange` itself owns no page bytes, only bookkeeping (record counts and
//! per-base-page TPS watermarks). Every operation takes `&self`: record
//! counts are atomics and the TPS map is behind its own `Mutex`, so a
//! `PageRange` can be shared (via `Arc`) with the background merge thread
//! without that thread ever needing to hold the owning `Table`'s lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use buffer::BufferPool;
use common::constants::RECORDS_PER_PAGE_RANGE;
use common::{DbResult, PageKey};
use hashbrown::HashMap;

/// Page-and-slot coordinates of a physical record within its page range.
pub type PageSlot = (usize, usize);

pub struct PageRange {
    total_cols: usize,
    table: Arc<str>,
    range_idx: usize,
    pool: Arc<BufferPool>,
    num_base_records: AtomicUsize,
    num_tail_records: AtomicUsize,
    /// `base_page_index -> last_merged_tail_rid`, defaulting to 0.
    tps: Mutex<HashMap<usize, i64>>,
}

impl PageRange {
    pub fn new(total_cols: usize, table: Arc<str>, range_idx: usize, pool: Arc<BufferPool>) -> Self {
        Self {
            total_cols,
            table,
            range_idx,
            pool,
            num_base_records: AtomicUsize::new(0),
            num_tail_records: AtomicUsize::new(0),
            tps: Mutex::new(HashMap::new()),
        }
    }

    /// Restores counters from persisted metadata (used by `Database::open`).
    pub fn restore(
        total_cols: usize,
        table: Arc<str>,
        range_idx: usize,
        pool: Arc<BufferPool>,
        num_base_records: usize,
        num_tail_records: usize,
        tps: HashMap<usize, i64>,
    ) -> Self {
        Self {
            total_cols,
            table,
            range_idx,
            pool,
            num_base_records: AtomicUsize::new(num_base_records),
            num_tail_records: AtomicUsize::new(num_tail_records),
            tps: Mutex::new(tps),
        }
    }

    pub fn range_idx(&self) -> usize {
        self.range_idx
    }

    pub fn num_base_records(&self) -> usize {
        self.num_base_records.load(Ordering::SeqCst)
    }

    pub fn num_tail_records(&self) -> usize {
        self.num_tail_records.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        self.num_base_records() < RECORDS_PER_PAGE_RANGE
    }

    /// Snapshot of the TPS map, for persistence.
    pub fn tps_snapshot(&self) -> HashMap<usize, i64> {
        self.tps.lock().unwrap().clone()
    }

    pub fn tps_for(&self, base_page: usize) -> i64 {
        self.tps.lock().unwrap().get(&base_page).copied().unwrap_or(0)
    }

    fn key(&self, is_tail: bool, page_idx: usize, col_idx: usize) -> PageKey {
        PageKey::new(self.table.clone(), self.range_idx, is_tail, page_idx, col_idx)
    }

    fn records_per_page() -> usize {
        common::constants::RECORDS_PER_PAGE
    }

    /// Writes every column of `values` (length `total_cols`) into the next
    /// base slot. Returns the `(page, slot)` the record landed at.
    ///
    /// The record count is only bumped after every column is written, so a
    /// concurrent merge reading `num_base_records()` never observes a
    /// partially-written row.
    pub fn add_base_record(&self, values: &[i64]) -> DbResult<PageSlot> {
        debug_assert_eq!(values.len(), self.total_cols);
        let rpp = Self::records_per_page();
        let idx = self.num_base_records.load(Ordering::SeqCst);
        let page_idx = idx / rpp;
        let slot = idx % rpp;
        for (col, &val) in values.iter().enumerate() {
            let key = self.key(false, page_idx, col);
            let page = self.pool.get_page(&key)?;
            page.lock().unwrap().write_at(slot, val)?;
            self.pool.mark_dirty(&key);
            self.pool.unpin(&key);
        }
        self.num_base_records.fetch_add(1, Ordering::SeqCst);
        Ok((page_idx, slot))
    }

    /// As `add_base_record`, for the tail side; never capacity-limited.
    pub fn add_tail_record(&self, values: &[i64]) -> DbResult<PageSlot> {
        debug_assert_eq!(values.len(), self.total_cols);
        let rpp = Self::records_per_page();
        let idx = self.num_tail_records.load(Ordering::SeqCst);
        let page_idx = idx / rpp;
        let slot = idx % rpp;
        for (col, &val) in values.iter().enumerate() {
            let key = self.key(true, page_idx, col);
            let page = self.pool.get_page(&key)?;
            page.lock().unwrap().write_at(slot, val)?;
            self.pool.mark_dirty(&key);
            self.pool.unpin(&key);
        }
        self.num_tail_records.fetch_add(1, Ordering::SeqCst);
        Ok((page_idx, slot))
    }

    pub fn get_base_val(&self, page_idx: usize, slot: usize, col: usize) -> DbResult<i64> {
        self.pool.read_value(&self.key(false, page_idx, col), slot)
    }

    pub fn get_tail_val(&self, page_idx: usize, slot: usize, col: usize) -> DbResult<i64> {
        self.pool.read_value(&self.key(true, page_idx, col), slot)
    }

    /// Reads `n` contiguous columns starting at `start_col` in one pass, to
    /// amortize buffer-pool overhead on the hot read path.
    pub fn get_base_vals(&self, page_idx: usize, slot: usize, start_col: usize, n: usize) -> DbResult<Vec<i64>> {
        (0..n)
            .map(|i| self.get_base_val(page_idx, slot, start_col + i))
            .collect()
    }

    pub fn get_tail_vals(&self, page_idx: usize, slot: usize, start_col: usize, n: usize) -> DbResult<Vec<i64>> {
        (0..n)
            .map(|i| self.get_tail_val(page_idx, slot, start_col + i))
            .collect()
    }

    pub fn set_base_val(&self, page_idx: usize, slot: usize, col: usize, val: i64) -> DbResult<()> {
        let key = self.key(false, page_idx, col);
        let page = self.pool.get_page(&key)?;
        page.lock().unwrap().write_at(slot, val)?;
        self.pool.mark_dirty(&key);
        self.pool.unpin(&key);
        Ok(())
    }

    /// Advances this base page's TPS watermark. Only the merge worker calls
    /// this; it never decreases the watermark.
    pub fn advance_tps(&self, base_page: usize, new_watermark: i64) {
        let mut tps = self.tps.lock().unwrap();
        let entry = tps.entry(base_page).or_insert(0);
        if new_watermark > *entry {
            *entry = new_watermark;
        }
    }
}

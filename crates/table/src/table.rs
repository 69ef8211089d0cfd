//! The `Table`: a sequence of page ranges, a RID allocator, a page
//! directory, a primary (plus optional secondary) index, and the merge
//! scheduler that stabilizes tails into base pages.

use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use buffer::BufferPool;
use common::constants::{
    INDIRECTION_COLUMN, NULL_RID, NUM_META_COLS, RECORDS_PER_PAGE, RECORDS_PER_PAGE_RANGE,
    RID_COLUMN,
};
use common::{DbError, DbResult};
use hashbrown::HashMap;
use index::Index;
use log::warn;

use crate::range::PageRange;

/// RID -> physical location: `(range_index, is_tail, page_index, slot)`.
pub type Location = (usize, bool, usize, usize);

/// Shared handle a `Query` and the merge worker both hold a clone of.
pub type TableHandle = Arc<RwLock<Table>>;

pub struct Table {
    name: Arc<str>,
    key: usize,
    num_columns: usize,
    total_cols: usize,
    pool: Arc<BufferPool>,
    /// Each range is behind an `Arc` so the merge thread can hold its own
    /// clone of the one it is folding, independent of this `Vec`'s storage
    /// (which may reallocate if another range is pushed) and of the `Table`
    /// lock (which the merge thread never touches once spawned).
    page_ranges: Vec<Arc<PageRange>>,
    page_directory: HashMap<i64, Location>,
    next_rid: i64,
    index: Index,
    merge_threshold: u64,
    merge_thread: Option<JoinHandle<()>>,
}

/// Everything a merge needs, captured while the `Table`'s write lock is
/// still held so the background thread can run the (slow, page-scanning)
/// merge algorithm without holding that lock for its duration.
struct MergeJob {
    range: Arc<PageRange>,
    directory: HashMap<i64, Location>,
    num_columns: usize,
    table_name: Arc<str>,
    range_idx: usize,
}

impl Table {
    pub fn new(name: impl Into<Arc<str>>, num_columns: usize, key: usize, pool: Arc<BufferPool>, merge_threshold: u64) -> Self {
        Self {
            name: name.into(),
            key,
            num_columns,
            total_cols: num_columns + NUM_META_COLS,
            pool,
            page_ranges: Vec::new(),
            page_directory: HashMap::new(),
            next_rid: 1,
            index: Index::new(num_columns, key),
            merge_threshold,
            merge_thread: None,
        }
    }

    pub fn into_handle(self) -> TableHandle {
        Arc::new(RwLock::new(self))
    }

    /// Reconstructs a table from persisted counters (`Database::open`).
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        name: impl Into<Arc<str>>,
        num_columns: usize,
        key: usize,
        pool: Arc<BufferPool>,
        merge_threshold: u64,
        next_rid: i64,
        page_directory: HashMap<i64, Location>,
        range_counters: Vec<(usize, usize, HashMap<usize, i64>)>,
    ) -> Self {
        let name: Arc<str> = name.into();
        let total_cols = num_columns + NUM_META_COLS;
        let page_ranges = range_counters
            .into_iter()
            .enumerate()
            .map(|(idx, (num_base, num_tail, tps))| {
                Arc::new(PageRange::restore(total_cols, name.clone(), idx, pool.clone(), num_base, num_tail, tps))
            })
            .collect();
        Self {
            name,
            key,
            num_columns,
            total_cols,
            pool,
            page_ranges,
            page_directory,
            next_rid,
            index: Index::new(num_columns, key),
            merge_threshold,
            merge_thread: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_col(&self) -> usize {
        self.key
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn total_cols(&self) -> usize {
        self.total_cols
    }

    pub fn next_rid_value(&self) -> i64 {
        self.next_rid
    }

    pub fn page_ranges(&self) -> &[Arc<PageRange>] {
        &self.page_ranges
    }

    pub fn page_directory(&self) -> &HashMap<i64, Location> {
        &self.page_directory
    }

    /// Allocates the next RID; RIDs are never reused.
    pub fn new_rid(&mut self) -> i64 {
        let r = self.next_rid;
        self.next_rid += 1;
        r
    }

    /// Returns the trailing page range, appending a fresh one if absent or
    /// full.
    pub fn current_range_idx(&mut self) -> usize {
        if self.page_ranges.last().is_none_or(|r| !r.has_capacity()) {
            let idx = self.page_ranges.len();
            self.page_ranges
                .push(Arc::new(PageRange::new(self.total_cols, self.name.clone(), idx, self.pool.clone())));
            idx
        } else {
            self.page_ranges.len() - 1
        }
    }

    pub fn range(&self, idx: usize) -> &PageRange {
        self.page_ranges[idx].as_ref()
    }

    pub fn contains_rid(&self, rid: i64) -> bool {
        self.page_directory.contains_key(&rid)
    }

    pub fn location_of(&self, rid: i64) -> Option<Location> {
        self.page_directory.get(&rid).copied()
    }

    pub fn register_location(&mut self, rid: i64, loc: Location) {
        self.page_directory.insert(rid, loc);
    }

    pub fn remove_location(&mut self, rid: i64) -> Option<Location> {
        self.page_directory.remove(&rid)
    }

    pub fn is_indexed(&self, col: usize) -> bool {
        self.index.is_indexed(col)
    }

    pub fn locate(&self, col: usize, val: i64) -> Vec<i64> {
        self.index.locate(col, val)
    }

    pub fn locate_range(&self, col: usize, lo: i64, hi: i64) -> Vec<i64> {
        self.index.locate_range(col, lo, hi)
    }

    pub fn index_insert_entry(&mut self, col: usize, val: i64, rid: i64) {
        self.index.insert_entry(col, val, rid);
    }

    pub fn index_delete_entry(&mut self, col: usize, val: i64, rid: i64) {
        self.index.delete_entry(col, val, rid);
    }

    pub fn index_update_entry(&mut self, col: usize, old_val: i64, new_val: i64, rid: i64) {
        self.index.update_entry(col, old_val, new_val, rid);
    }

    /// Enables an index on `col` and populates it by scanning the page
    /// directory for non-tail RIDs and reading the column through the
    /// version walk (version 0 — current value). Returns `false` if the
    /// column was already indexed.
    pub fn create_index(&mut self, col: usize) -> DbResult<bool> {
        if !self.index.create_index(col) {
            return Ok(false);
        }
        let rids: Vec<i64> = self
            .page_directory
            .iter()
            .filter(|(_, &(_, is_tail, _, _))| !is_tail)
            .map(|(&rid, _)| rid)
            .collect();
        for rid in rids {
            let vals = self.record_values(rid, 0)?;
            self.index.insert_entry(col, vals[col], rid);
        }
        Ok(true)
    }

    pub fn drop_index(&mut self, col: usize) {
        self.index.drop_index(col);
    }

    /// Version walk with TPS short-circuit (spec §4.6.1). `version = 0`
    /// means "latest"; `version = v` walks `|v|` hops back from the head,
    /// falling back to base if the chain runs out early.
    pub fn record_values(&self, base_rid: i64, version: i64) -> DbResult<Vec<i64>> {
        let (ri, _, pg, slot) = self
            .page_directory
            .get(&base_rid)
            .copied()
            .ok_or(DbError::UnknownRid(base_rid))?;
        let base_range = &self.page_ranges[ri];
        let indir = base_range.get_base_val(pg, slot, INDIRECTION_COLUMN)?;
        if indir == NULL_RID {
            return base_range.get_base_vals(pg, slot, NUM_META_COLS, self.num_columns);
        }
        if version == 0 {
            let tps = base_range.tps_for(pg);
            if indir <= tps {
                return base_range.get_base_vals(pg, slot, NUM_META_COLS, self.num_columns);
            }
        }

        let mut cur = indir;
        for _ in 0..version.unsigned_abs() {
            let (ti, _, tpg, tslot) = self
                .page_directory
                .get(&cur)
                .copied()
                .ok_or(DbError::UnknownRid(cur))?;
            let prev = self.page_ranges[ti].get_tail_val(tpg, tslot, INDIRECTION_COLUMN)?;
            if prev == NULL_RID {
                return base_range.get_base_vals(pg, slot, NUM_META_COLS, self.num_columns);
            }
            cur = prev;
        }
        let (ti, _, tpg, tslot) = self
            .page_directory
            .get(&cur)
            .copied()
            .ok_or(DbError::UnknownRid(cur))?;
        self.page_ranges[ti].get_tail_vals(tpg, tslot, NUM_META_COLS, self.num_columns)
    }

    /// Folds tail values into base pages for `range_idx` and advances each
    /// base page's TPS watermark. Best-effort: errors are logged and
    /// swallowed (spec §4.7/§7) so a failed merge can simply be retried —
    /// already-advanced pages within the same call keep their progress.
    pub fn merge(&self, range_idx: usize) {
        let Some(job) = self.merge_job(range_idx) else {
            warn!("table {}: merge requested for missing range {range_idx}", self.name);
            return;
        };
        Self::run_merge_job(&job);
    }

    /// Snapshots everything a merge of `range_idx` needs: the range's own
    /// `Arc` (shared bookkeeping, no `Table` lock required to use it) and a
    /// clone of the page directory. Called while the `Table`'s write lock is
    /// still held, so the returned job can be handed to a background thread
    /// that never touches this table's lock again.
    fn merge_job(&self, range_idx: usize) -> Option<MergeJob> {
        let range = self.page_ranges.get(range_idx)?.clone();
        Some(MergeJob {
            range,
            directory: self.page_directory.clone(),
            num_columns: self.num_columns,
            table_name: self.name.clone(),
            range_idx,
        })
    }

    fn run_merge_job(job: &MergeJob) {
        if let Err(e) = try_merge_range(&job.range, &job.directory, job.num_columns) {
            warn!("table {}: merge of range {} failed: {e}", job.table_name, job.range_idx);
        }
    }

    /// Spawns a background merge of `range_idx` if its tail-record count has
    /// crossed `merge_threshold` and no merge for this table is already
    /// running. The write lock is only held long enough to snapshot the
    /// `MergeJob`; the spawned thread runs the scan against that snapshot,
    /// so concurrent `insert`/`update`/`delete` calls are never blocked by
    /// an in-progress merge.
    pub fn maybe_trigger_merge(handle: &TableHandle, range_idx: usize) {
        let mut table = handle.write().unwrap();
        let Some(pr) = table.page_ranges.get(range_idx) else {
            return;
        };
        if (pr.num_tail_records() as u64) < table.merge_threshold {
            return;
        }
        if table.merge_thread.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Some(job) = table.merge_job(range_idx) else {
            return;
        };
        table.merge_thread = Some(thread::spawn(move || Table::run_merge_job(&job)));
    }

    /// Joins any running merge thread. Called from `Database::close`.
    pub fn join_merge(handle: &TableHandle) {
        let existing = handle.write().unwrap().merge_thread.take();
        if let Some(h) = existing {
            let _ = h.join();
        }
    }
}

#[allow(dead_code)]
const fn _assert_capacity() {
    assert!(RECORDS_PER_PAGE_RANGE == RECORDS_PER_PAGE * 128);
}

/// The actual merge scan: folds tail values into base pages for `range` and
/// advances each base page's TPS watermark. Takes only the snapshot a
/// [`MergeJob`] captures — no `Table` reference, so this runs fine on a
/// background thread while writers hold the `Table`'s write lock.
fn try_merge_range(range: &PageRange, directory: &HashMap<i64, Location>, num_columns: usize) -> DbResult<()> {
    let nrec = range.num_base_records();
    let npages = nrec.div_ceil(RECORDS_PER_PAGE);
    for p in 0..npages {
        let mut max_tail = range.tps_for(p);
        let nslots = RECORDS_PER_PAGE.min(nrec - p * RECORDS_PER_PAGE);
        for s in 0..nslots {
            let rid = range.get_base_val(p, s, RID_COLUMN)?;
            if !directory.contains_key(&rid) {
                continue;
            }
            let t = range.get_base_val(p, s, INDIRECTION_COLUMN)?;
            if t == NULL_RID || t <= max_tail {
                continue;
            }
            let Some(&(_, _, tpg, tslot)) = directory.get(&t) else {
                continue;
            };
            let vals = range.get_tail_vals(tpg, tslot, NUM_META_COLS, num_columns)?;
            for (i, v) in vals.into_iter().enumerate() {
                range.set_base_val(p, s, NUM_META_COLS + i, v)?;
            }
            max_tail = max_tail.max(t);
        }
        range.advance_tps(p, max_tail);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn handle(dir: &std::path::Path) -> TableHandle {
        let pool = Arc::new(BufferPool::new(dir, 100));
        Table::new("t", 3, 0, pool, 4).into_handle()
    }

    fn insert_row(handle: &TableHandle, vals: [i64; 3]) -> i64 {
        let mut table = handle.write().unwrap();
        let rid = table.new_rid();
        let range_idx = table.current_range_idx();
        let mut row = vec![0i64; table.total_cols()];
        row[RID_COLUMN] = rid;
        row[NUM_META_COLS] = vals[0];
        row[NUM_META_COLS + 1] = vals[1];
        row[NUM_META_COLS + 2] = vals[2];
        let (pg, slot) = table.range(range_idx).add_base_record(&row).unwrap();
        table.register_location(rid, (range_idx, false, pg, slot));
        table.index_insert_entry(0, vals[0], rid);
        rid
    }

    #[test]
    fn insert_then_read_current_values() {
        let dir = tempdir().unwrap();
        let h = handle(dir.path());
        let rid = insert_row(&h, [10, 20, 30]);
        let table = h.read().unwrap();
        assert_eq!(table.record_values(rid, 0).unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn unknown_rid_errors() {
        let dir = tempdir().unwrap();
        let h = handle(dir.path());
        let table = h.read().unwrap();
        assert!(matches!(table.record_values(999, 0), Err(DbError::UnknownRid(999))));
    }

    #[test]
    fn merge_folds_tail_into_base_and_advances_tps() {
        let dir = tempdir().unwrap();
        let h = handle(dir.path());
        let rid = insert_row(&h, [10, 20, 30]);

        // simulate an update by hand: append a tail row, point base at it.
        let tail_rid = {
            let mut table = h.write().unwrap();
            let tail_rid = table.new_rid();
            let (ri, _, pg, slot) = table.location_of(rid).unwrap();
            let old_indir = table.range(ri).get_base_val(pg, slot, INDIRECTION_COLUMN).unwrap();
            let mut tail = vec![0i64; table.total_cols()];
            tail[INDIRECTION_COLUMN] = old_indir;
            tail[RID_COLUMN] = tail_rid;
            tail[NUM_META_COLS] = 10;
            tail[NUM_META_COLS + 1] = 999;
            tail[NUM_META_COLS + 2] = 30;
            let (tpg, tslot) = table.range(ri).add_tail_record(&tail).unwrap();
            table.register_location(tail_rid, (ri, true, tpg, tslot));
            table.range(ri).set_base_val(pg, slot, INDIRECTION_COLUMN, tail_rid).unwrap();
            tail_rid
        };

        h.read().unwrap().merge(0);

        let table = h.read().unwrap();
        let (_, _, pg, slot) = table.location_of(rid).unwrap();
        assert_eq!(table.range(0).get_base_val(pg, slot, NUM_META_COLS + 1).unwrap(), 999);
        assert!(table.range(0).tps_for(0) >= tail_rid);
    }

    #[test]
    fn merge_is_idempotent() {
        let dir = tempdir().unwrap();
        let h = handle(dir.path());
        insert_row(&h, [1, 2, 3]);
        h.read().unwrap().merge(0);
        let tps_once = h.read().unwrap().range(0).tps_for(0);
        h.read().unwrap().merge(0);
        assert_eq!(h.read().unwrap().range(0).tps_for(0), tps_once);
    }

    #[test]
    fn full_range_allocates_a_fresh_range_on_next_insert() {
        let dir = tempdir().unwrap();
        let pool = Arc::new(BufferPool::new(dir.path(), 100));
        // Restore a table whose sole range already reports itself as full,
        // without actually writing 65,536 records through the buffer pool.
        let mut table = Table::restore(
            "t",
            3,
            0,
            pool,
            4,
            1,
            HashMap::new(),
            vec![(RECORDS_PER_PAGE_RANGE, 0, HashMap::new())],
        );
        assert!(!table.range(0).has_capacity());
        let idx = table.current_range_idx();
        assert_eq!(idx, 1, "a full range must not receive the next base record");
        assert_eq!(table.page_ranges().len(), 2);
    }

    #[test]
    fn create_index_populates_from_existing_rows() {
        let dir = tempdir().unwrap();
        let h = handle(dir.path());
        insert_row(&h, [1, 100, 0]);
        insert_row(&h, [2, 200, 0]);
        let mut table = h.write().unwrap();
        assert!(table.create_index(1).unwrap());
        assert!(!table.create_index(1).unwrap());
        assert_eq!(table.locate(1, 100), vec![1]);
        assert_eq!(table.locate(1, 200), vec![2]);
    }

    /// Appends a tail row that changes column 1 to `new_val`, the way
    /// `Query::update` would, without going through the query layer.
    fn update_col1(h: &TableHandle, base_rid: i64, new_val: i64) {
        let mut table = h.write().unwrap();
        let (ri, _, pg, slot) = table.location_of(base_rid).unwrap();
        let old_indir = table.range(ri).get_base_val(pg, slot, INDIRECTION_COLUMN).unwrap();
        let mut cur = table.record_values(base_rid, 0).unwrap();
        cur[1] = new_val;
        let tail_rid = table.new_rid();
        let mut tail = vec![0i64; table.total_cols()];
        tail[INDIRECTION_COLUMN] = old_indir;
        tail[RID_COLUMN] = tail_rid;
        tail[NUM_META_COLS] = cur[0];
        tail[NUM_META_COLS + 1] = cur[1];
        tail[NUM_META_COLS + 2] = cur[2];
        let (tpg, tslot) = table.range(ri).add_tail_record(&tail).unwrap();
        table.register_location(tail_rid, (ri, true, tpg, tslot));
        table.range(ri).set_base_val(pg, slot, INDIRECTION_COLUMN, tail_rid).unwrap();
    }

    use proptest::prelude::*;

    proptest! {
        // RIDs allocated by a single table are strictly increasing and never
        // reused, regardless of how many are drawn.
        #[test]
        fn new_rid_is_strictly_monotonic(n in 1usize..200) {
            let dir = tempdir().unwrap();
            let h = handle(dir.path());
            let mut table = h.write().unwrap();
            let mut prev = table.new_rid();
            for _ in 1..n {
                let next = table.new_rid();
                prop_assert!(next > prev);
                prev = next;
            }
        }

        // After `updates.len()` updates to the same row's column 1, walking
        // back `k` versions (0 <= k <= n) must reproduce the value seen right
        // after the `(n - k)`-th update; walking further back than the first
        // update falls back to the original insert value.
        #[test]
        fn version_walk_reproduces_update_history(updates in prop::collection::vec(any::<i64>(), 1..8)) {
            let dir = tempdir().unwrap();
            let h = handle(dir.path());
            let original = [10i64, 20, 30];
            let rid = insert_row(&h, original);

            for &v in &updates {
                update_col1(&h, rid, v);
            }

            let n = updates.len();
            let table = h.read().unwrap();
            for k in 0..=n {
                let expected = if k == n { original[1] } else { updates[n - 1 - k] };
                let got = table.record_values(rid, -(k as i64)).unwrap();
                prop_assert_eq!(got[1], expected);
            }
            // Falling off the far end of the chain still resolves to base.
            let got = table.record_values(rid, -(n as i64 + 5)).unwrap();
            prop_assert_eq!(got[1], original[1]);
        }
    }
}

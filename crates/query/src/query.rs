//! The request-handling layer: `insert`/`select`/`select_version`/`update`/
//! `delete`/`sum`/`sum_version`/`increment`, grounded directly on
//! `lstore/query.py`'s `Query` class.
//!
//! Every mutating operation reports success or failure as a plain `bool` (or
//! `Option` for reads/aggregates) rather than raising — callers scripting a
//! long sequence of operations never see exception-like control flow.
//! Internally, `DbResult<T>` threads through so a failure's cause is not
//! lost before it collapses to the legacy sentinel at this boundary.

use std::time::{SystemTime, UNIX_EPOCH};

use common::constants::{
    INDIRECTION_COLUMN, NUM_META_COLS, RID_COLUMN, SCHEMA_ENCODING_COLUMN, TIMESTAMP_COLUMN,
};
use common::DbResult;
use table::{Table, TableHandle};

use crate::record::Record;

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct Query {
    table: TableHandle,
}

impl Query {
    pub fn new(table: TableHandle) -> Self {
        Self { table }
    }

    /// Column-value lookup with automatic full-scan fallback when `col`
    /// isn't indexed (an unindexed `Index::locate` returns empty, which is
    /// its documented signal to the caller to fall back to a scan).
    fn locate_rids(table: &Table, col: usize, val: i64) -> Vec<i64> {
        if table.is_indexed(col) {
            return table.locate(col, val);
        }
        table
            .page_directory()
            .iter()
            .filter(|(_, &(_, is_tail, _, _))| !is_tail)
            .filter_map(|(&rid, _)| {
                table
                    .record_values(rid, 0)
                    .ok()
                    .filter(|vals| vals[col] == val)
                    .map(|_| rid)
            })
            .collect()
    }

    fn locate_range_rids(table: &Table, col: usize, lo: i64, hi: i64) -> Vec<i64> {
        if table.is_indexed(col) {
            return table.locate_range(col, lo, hi);
        }
        table
            .page_directory()
            .iter()
            .filter(|(_, &(_, is_tail, _, _))| !is_tail)
            .filter_map(|(&rid, _)| {
                table
                    .record_values(rid, 0)
                    .ok()
                    .filter(|vals| vals[col] >= lo && vals[col] <= hi)
                    .map(|_| rid)
            })
            .collect()
    }

    /// Rejects if arity mismatches or the key already exists. Allocates a
    /// RID, appends the base row, and registers it in the page directory and
    /// every active column index.
    pub fn insert(&self, cols: &[i64]) -> bool {
        self.try_insert(cols).unwrap_or(false)
    }

    fn try_insert(&self, cols: &[i64]) -> DbResult<bool> {
        let mut table = self.table.write().unwrap();
        if cols.len() != table.num_columns() {
            return Ok(false);
        }
        let key_col = table.key_col();
        let key_val = cols[key_col];
        if !table.locate(key_col, key_val).is_empty() {
            return Ok(false);
        }

        let rid = table.new_rid();
        let range_idx = table.current_range_idx();
        let mut row = vec![0i64; table.total_cols()];
        row[RID_COLUMN] = rid;
        row[TIMESTAMP_COLUMN] = now_seconds();
        for (i, &v) in cols.iter().enumerate() {
            row[NUM_META_COLS + i] = v;
        }
        let (pg, slot) = table.range(range_idx).add_base_record(&row)?;
        table.register_location(rid, (range_idx, false, pg, slot));

        for col in 0..table.num_columns() {
            if table.is_indexed(col) {
                table.index_insert_entry(col, cols[col], rid);
            }
        }
        Ok(true)
    }

    /// Current-value projection: `_locate` by `search_col` (index or scan),
    /// then for each surviving RID, a version-0 walk and a projection mask.
    pub fn select(&self, search_key: i64, search_col: usize, projection: &[bool]) -> Option<Vec<Record>> {
        self.select_version(search_key, search_col, projection, 0)
    }

    pub fn select_version(
        &self,
        search_key: i64,
        search_col: usize,
        projection: &[bool],
        version: i64,
    ) -> Option<Vec<Record>> {
        let table = self.table.read().unwrap();
        if projection.len() != table.num_columns() {
            return None;
        }
        let rids = Self::locate_rids(&table, search_col, search_key);
        if rids.is_empty() {
            return Some(Vec::new());
        }
        let mut out = Vec::with_capacity(rids.len());
        for rid in rids {
            if !table.contains_rid(rid) {
                continue;
            }
            let vals = table.record_values(rid, version).ok()?;
            let cols = vals
                .into_iter()
                .zip(projection.iter())
                .map(|(v, &p)| p.then_some(v))
                .collect();
            out.push(Record::new(rid, search_key, cols));
        }
        Some(out)
    }

    /// Requires an existing row and rejects any change to the primary-key
    /// column outright. Reads current values through the version walk,
    /// merges in the non-`None` columns, appends a tail row, flips the
    /// base's indirection and OR's in the schema-change bitmap, then updates
    /// any indexed column whose effective value changed.
    pub fn update(&self, pk: i64, cols: &[Option<i64>]) -> bool {
        self.try_update(pk, cols).unwrap_or(false)
    }

    fn try_update(&self, pk: i64, cols: &[Option<i64>]) -> DbResult<bool> {
        let mut table = self.table.write().unwrap();
        let key_col = table.key_col();
        if cols.len() != table.num_columns() {
            return Ok(false);
        }
        let Some(&base_rid) = table.locate(key_col, pk).first() else {
            return Ok(false);
        };
        if !table.contains_rid(base_rid) {
            return Ok(false);
        }
        if let Some(new_pk) = cols[key_col]
            && new_pk != pk
        {
            return Ok(false);
        }

        let (ri, _, pg, slot) = table.location_of(base_rid).expect("checked above");
        let old_indir = table.range(ri).get_base_val(pg, slot, INDIRECTION_COLUMN)?;
        let cur_vals = table.record_values(base_rid, 0)?;

        let num_columns = table.num_columns();
        let mut new_vals = cur_vals.clone();
        let mut schema: i64 = 0;
        for i in 0..num_columns {
            if let Some(v) = cols[i] {
                new_vals[i] = v;
                schema |= 1 << i;
            }
        }

        let tail_rid = table.new_rid();
        let mut tail_row = vec![0i64; table.total_cols()];
        tail_row[INDIRECTION_COLUMN] = old_indir;
        tail_row[RID_COLUMN] = tail_rid;
        tail_row[TIMESTAMP_COLUMN] = now_seconds();
        tail_row[SCHEMA_ENCODING_COLUMN] = schema;
        for i in 0..num_columns {
            tail_row[NUM_META_COLS + i] = new_vals[i];
        }
        let (tpg, tslot) = table.range(ri).add_tail_record(&tail_row)?;
        table.register_location(tail_rid, (ri, true, tpg, tslot));

        table.range(ri).set_base_val(pg, slot, INDIRECTION_COLUMN, tail_rid)?;
        let old_schema = table.range(ri).get_base_val(pg, slot, SCHEMA_ENCODING_COLUMN)?;
        table
            .range(ri)
            .set_base_val(pg, slot, SCHEMA_ENCODING_COLUMN, old_schema | schema)?;

        for i in 0..num_columns {
            if cols[i].is_some() && new_vals[i] != cur_vals[i] && table.is_indexed(i) {
                table.index_update_entry(i, cur_vals[i], new_vals[i], base_rid);
            }
        }
        drop(table);
        Table::maybe_trigger_merge(&self.table, ri);
        Ok(true)
    }

    /// Finds the RID by primary key, removes it from every active column
    /// index, then removes it from the page directory. Tail records are
    /// left in place — unreachable, but not erased.
    pub fn delete(&self, pk: i64) -> bool {
        self.try_delete(pk).unwrap_or(false)
    }

    fn try_delete(&self, pk: i64) -> DbResult<bool> {
        let mut table = self.table.write().unwrap();
        let key_col = table.key_col();
        let Some(&rid) = table.locate(key_col, pk).first() else {
            return Ok(false);
        };
        if !table.contains_rid(rid) {
            return Ok(false);
        }
        let vals = table.record_values(rid, 0)?;
        for col in 0..table.num_columns() {
            if table.is_indexed(col) {
                table.index_delete_entry(col, vals[col], rid);
            }
        }
        table.remove_location(rid);
        Ok(true)
    }

    /// Range-locates by primary key and accumulates `agg_col` across the
    /// current value of each surviving RID.
    pub fn sum(&self, lo: i64, hi: i64, agg_col: usize) -> Option<i64> {
        self.sum_version(lo, hi, agg_col, 0)
    }

    pub fn sum_version(&self, lo: i64, hi: i64, agg_col: usize, version: i64) -> Option<i64> {
        let table = self.table.read().unwrap();
        let key_col = table.key_col();
        let rids = Self::locate_range_rids(&table, key_col, lo, hi);
        if rids.is_empty() {
            return None;
        }
        let mut total: i64 = 0;
        for rid in rids {
            if !table.contains_rid(rid) {
                continue;
            }
            let vals = table.record_values(rid, version).ok()?;
            total += vals[agg_col];
        }
        Some(total)
    }

    /// Reads the current value of `col` and writes back `col + 1`.
    pub fn increment(&self, key: i64, col: usize) -> bool {
        let num_columns = self.table.read().unwrap().num_columns();
        let key_col = self.table.read().unwrap().key_col();
        let projection = vec![true; num_columns];
        let Some(rows) = self.select(key, key_col, &projection) else {
            return false;
        };
        let Some(record) = rows.first() else {
            return false;
        };
        let Some(cur) = record.columns[col] else {
            return false;
        };
        let mut updates = vec![None; num_columns];
        updates[col] = Some(cur + 1);
        self.update(key, &updates)
    }
}

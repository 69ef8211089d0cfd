//! Per-column secondary index: a hash map from value to the RIDs that carry
//! it, plus a sorted sidecar of live keys for `O(log n + k)` range scans.
//!
//! The key column is always indexed; every other column is opt-in via
//! `create_index`. An unindexed column's `locate`/`locate_range` return an
//! empty list, signaling the caller to fall back to a full table scan.

use hashbrown::HashMap;

/// Holds one optional `(value -> RIDs, sorted keys)` pair per user column.
pub struct Index {
    maps: Vec<Option<HashMap<i64, Vec<i64>>>>,
    sorted_keys: Vec<Option<Vec<i64>>>,
}

impl Index {
    /// `num_columns` is the number of user columns (metadata columns are not
    /// indexed); `key_col` is pre-enabled since every table must be able to
    /// resolve its primary key.
    pub fn new(num_columns: usize, key_col: usize) -> Self {
        let mut maps: Vec<Option<HashMap<i64, Vec<i64>>>> = vec![None; num_columns];
        let mut sorted_keys: Vec<Option<Vec<i64>>> = vec![None; num_columns];
        maps[key_col] = Some(HashMap::new());
        sorted_keys[key_col] = Some(Vec::new());
        Self { maps, sorted_keys }
    }

    pub fn is_indexed(&self, col: usize) -> bool {
        self.maps.get(col).is_some_and(|m| m.is_some())
    }

    /// Returns a copy of the RIDs carrying `val` in `col`, or an empty list
    /// if `col` is unindexed.
    pub fn locate(&self, col: usize, val: i64) -> Vec<i64> {
        self.maps
            .get(col)
            .and_then(|m| m.as_ref())
            .and_then(|m| m.get(&val))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the RIDs whose value in `col` falls in `[lo, hi]`, inclusive.
    pub fn locate_range(&self, col: usize, lo: i64, hi: i64) -> Vec<i64> {
        let (Some(Some(map)), Some(Some(keys))) = (self.maps.get(col), self.sorted_keys.get(col))
        else {
            return Vec::new();
        };
        let low = keys.partition_point(|&k| k < lo);
        let high = keys.partition_point(|&k| k <= hi);
        let mut out = Vec::new();
        for k in &keys[low..high] {
            if let Some(rids) = map.get(k) {
                out.extend_from_slice(rids);
            }
        }
        out
    }

    /// No-op if `col` is unindexed.
    pub fn insert_entry(&mut self, col: usize, val: i64, rid: i64) {
        let Some(Some(map)) = self.maps.get_mut(col) else {
            return;
        };
        let is_new_key = !map.contains_key(&val);
        map.entry(val).or_default().push(rid);
        if is_new_key && let Some(Some(keys)) = self.sorted_keys.get_mut(col) {
            let pos = keys.partition_point(|&k| k < val);
            keys.insert(pos, val);
        }
    }

    /// Removes the last-for-value entry from the sorted sidecar once `val`
    /// has no remaining RIDs. No-op if `col` is unindexed or `val`/`rid`
    /// aren't present.
    pub fn delete_entry(&mut self, col: usize, val: i64, rid: i64) {
        let Some(Some(map)) = self.maps.get_mut(col) else {
            return;
        };
        let Some(rids) = map.get_mut(&val) else {
            return;
        };
        if let Some(pos) = rids.iter().position(|&r| r == rid) {
            rids.remove(pos);
        }
        if rids.is_empty() {
            map.remove(&val);
            if let Some(Some(keys)) = self.sorted_keys.get_mut(col)
                && let Ok(pos) = keys.binary_search(&val)
            {
                keys.remove(pos);
            }
        }
    }

    pub fn update_entry(&mut self, col: usize, old_val: i64, new_val: i64, rid: i64) {
        self.delete_entry(col, old_val, rid);
        self.insert_entry(col, new_val, rid);
    }

    /// Enables empty structures for `col`. Returns `true` if this newly
    /// enabled the column (the caller is then responsible for populating it
    /// by scanning existing rows), `false` if it was already indexed.
    pub fn create_index(&mut self, col: usize) -> bool {
        match self.maps.get_mut(col) {
            Some(slot @ None) => {
                *slot = Some(HashMap::new());
                self.sorted_keys[col] = Some(Vec::new());
                true
            }
            _ => false,
        }
    }

    pub fn drop_index(&mut self, col: usize) {
        if let Some(slot) = self.maps.get_mut(col) {
            *slot = None;
        }
        if let Some(slot) = self.sorted_keys.get_mut(col) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn key_column_is_indexed_by_default() {
        let idx = Index::new(3, 0);
        assert!(idx.is_indexed(0));
        assert!(!idx.is_indexed(1));
    }

    #[test]
    fn locate_on_unindexed_column_is_empty() {
        let idx = Index::new(3, 0);
        assert_eq!(idx.locate(1, 5), Vec::<i64>::new());
    }

    #[test]
    fn insert_and_locate_round_trip() {
        let mut idx = Index::new(2, 0);
        idx.insert_entry(0, 10, 1);
        idx.insert_entry(0, 10, 2);
        idx.insert_entry(0, 20, 3);
        assert_eq!(idx.locate(0, 10), vec![1, 2]);
        assert_eq!(idx.locate(0, 20), vec![3]);
        assert_eq!(idx.locate(0, 30), Vec::<i64>::new());
    }

    #[test]
    fn locate_range_uses_sorted_sidecar() {
        let mut idx = Index::new(2, 0);
        for key in [5, 1, 9, 3, 7] {
            idx.insert_entry(0, key, key * 100);
        }
        let mut rids = idx.locate_range(0, 3, 7);
        rids.sort();
        assert_eq!(rids, vec![300, 500, 700]);
    }

    #[test]
    fn delete_last_rid_removes_sorted_entry() {
        let mut idx = Index::new(2, 0);
        idx.insert_entry(0, 42, 1);
        idx.delete_entry(0, 42, 1);
        assert_eq!(idx.locate(0, 42), Vec::<i64>::new());
        assert_eq!(idx.locate_range(0, 0, 100), Vec::<i64>::new());
    }

    #[test]
    fn delete_keeps_entry_while_other_rids_remain() {
        let mut idx = Index::new(2, 0);
        idx.insert_entry(0, 42, 1);
        idx.insert_entry(0, 42, 2);
        idx.delete_entry(0, 42, 1);
        assert_eq!(idx.locate(0, 42), vec![2]);
    }

    #[test]
    fn update_entry_moves_rid_between_values() {
        let mut idx = Index::new(2, 0);
        idx.insert_entry(0, 1, 100);
        idx.update_entry(0, 1, 2, 100);
        assert_eq!(idx.locate(0, 1), Vec::<i64>::new());
        assert_eq!(idx.locate(0, 2), vec![100]);
    }

    #[test]
    fn create_index_is_idempotent() {
        let mut idx = Index::new(2, 0);
        assert!(idx.create_index(1));
        assert!(!idx.create_index(1));
    }

    #[test]
    fn drop_index_clears_column() {
        let mut idx = Index::new(2, 0);
        idx.create_index(1);
        idx.insert_entry(1, 7, 1);
        idx.drop_index(1);
        assert!(!idx.is_indexed(1));
        assert_eq!(idx.locate(1, 7), Vec::<i64>::new());
    }
}

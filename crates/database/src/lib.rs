//! Database lifecycle: `open`, `close`, and the table registry, grounded on
//! `lstore/db.py`'s `Database` class.
//!
//! There is no WAL: durability is provided entirely by `close()` flushing
//! the buffer pool and writing `db_meta.json`/`table_meta.json`. A process
//! crash between a mutation and the next `close()` may lose that mutation
//! and leave page files inconsistent — acceptable within this engine's
//! design envelope (spec'd, not accidental).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use buffer::BufferPool;
use common::constants::NUM_META_COLS;
use common::{Config, DbError, DbResult};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use table::{Location, Table, TableHandle};

#[derive(Serialize, Deserialize)]
struct TableMetaEntry {
    name: String,
    num_columns: usize,
    key: usize,
}

#[derive(Serialize, Deserialize)]
struct DbMetaFile {
    tables: HashMap<String, TableMetaEntry>,
}

#[derive(Serialize, Deserialize)]
struct RangeMetaFile {
    num_base_records: usize,
    num_tail_records: usize,
    tps: HashMap<String, i64>,
}

#[derive(Serialize, Deserialize)]
struct TableMetaFile {
    next_rid: i64,
    page_directory: HashMap<String, Location>,
    page_ranges: Vec<RangeMetaFile>,
}

/// Owns the shared buffer pool and every open table, and is the unit of
/// durability: nothing is guaranteed on disk until `close()` returns.
pub struct Database {
    path: PathBuf,
    pool: Arc<BufferPool>,
    config: Config,
    tables: HashMap<String, TableHandle>,
}

impl Database {
    /// Opens (or creates) a database at `path` with default pool capacity
    /// and merge threshold.
    pub fn open(path: impl Into<PathBuf>) -> DbResult<Self> {
        let config = Config::builder().data_dir(path.into()).build();
        Self::open_with_config(config)
    }

    pub fn open_with_config(config: Config) -> DbResult<Self> {
        let path = config.data_dir.clone();
        fs::create_dir_all(&path)?;
        let pool = Arc::new(BufferPool::new(&path, config.buffer_pool_capacity));

        let meta_path = path.join("db_meta.json");
        let mut tables = HashMap::new();
        if meta_path.exists() {
            let db_meta: DbMetaFile = serde_json::from_slice(&fs::read(&meta_path)?)
                .map_err(|e| DbError::Metadata(e.to_string()))?;
            for (tname, entry) in db_meta.tables {
                let table = Self::load_table(&path, &pool, &entry, config.merge_threshold)?;
                tables.insert(tname, table.into_handle());
            }
        }

        Ok(Self { path, pool, config, tables })
    }

    fn load_table(
        path: &Path,
        pool: &Arc<BufferPool>,
        entry: &TableMetaEntry,
        merge_threshold: u64,
    ) -> DbResult<Table> {
        let table_meta_path = path.join(&entry.name).join("table_meta.json");
        let mut table = if table_meta_path.exists() {
            let raw: TableMetaFile = serde_json::from_slice(&fs::read(&table_meta_path)?)
                .map_err(|e| DbError::Metadata(e.to_string()))?;
            let page_directory: HashMap<i64, Location> = raw
                .page_directory
                .into_iter()
                .map(|(rid, loc)| {
                    rid.parse::<i64>()
                        .map(|rid| (rid, loc))
                        .map_err(|e| DbError::Metadata(e.to_string()))
                })
                .collect::<DbResult<_>>()?;
            let range_counters = raw
                .page_ranges
                .into_iter()
                .map(|r| {
                    let tps = r
                        .tps
                        .into_iter()
                        .map(|(pg, watermark)| {
                            pg.parse::<usize>()
                                .map(|pg| (pg, watermark))
                                .map_err(|e| DbError::Metadata(e.to_string()))
                        })
                        .collect::<DbResult<_>>()?;
                    Ok((r.num_base_records, r.num_tail_records, tps))
                })
                .collect::<DbResult<Vec<_>>>()?;
            Table::restore(
                entry.name.clone(),
                entry.num_columns,
                entry.key,
                pool.clone(),
                merge_threshold,
                raw.next_rid,
                page_directory,
                range_counters,
            )
        } else {
            Table::new(entry.name.clone(), entry.num_columns, entry.key, pool.clone(), merge_threshold)
        };
        Self::rebuild_key_index(&mut table);
        Ok(table)
    }

    /// Rebuilds the primary index by reading only the key column directly
    /// from each non-tail base record (bypassing the version walk — there's
    /// no tail chain to fold for a column that never changes once restored).
    fn rebuild_key_index(table: &mut Table) {
        let key_col = table.key_col();
        let locations: Vec<(i64, Location)> = table
            .page_directory()
            .iter()
            .filter(|(_, &(_, is_tail, _, _))| !is_tail)
            .map(|(&rid, &loc)| (rid, loc))
            .collect();
        for (rid, (ri, _, pg, slot)) in locations {
            if let Ok(key_val) = table.range(ri).get_base_val(pg, slot, NUM_META_COLS + key_col) {
                table.index_insert_entry(key_col, key_val, rid);
            }
        }
    }

    /// Joins any running merge thread per table, flushes the buffer pool,
    /// then serializes `db_meta.json` and each table's `table_meta.json`.
    pub fn close(&mut self) -> DbResult<()> {
        for handle in self.tables.values() {
            Table::join_merge(handle);
        }
        self.pool.flush_all()?;

        let db_meta = DbMetaFile {
            tables: self
                .tables
                .iter()
                .map(|(name, handle)| {
                    let table = handle.read().unwrap();
                    (
                        name.clone(),
                        TableMetaEntry {
                            name: table.name().to_string(),
                            num_columns: table.num_columns(),
                            key: table.key_col(),
                        },
                    )
                })
                .collect(),
        };
        fs::write(
            self.path.join("db_meta.json"),
            serde_json::to_vec(&db_meta).map_err(|e| DbError::Metadata(e.to_string()))?,
        )?;

        for (name, handle) in &self.tables {
            let table = handle.read().unwrap();
            let table_dir = self.path.join(name);
            fs::create_dir_all(&table_dir)?;

            let page_directory = table
                .page_directory()
                .iter()
                .map(|(rid, &loc)| (rid.to_string(), loc))
                .collect();
            let page_ranges = table
                .page_ranges()
                .iter()
                .map(|r| RangeMetaFile {
                    num_base_records: r.num_base_records(),
                    num_tail_records: r.num_tail_records(),
                    tps: r.tps_snapshot().into_iter().map(|(pg, v)| (pg.to_string(), v)).collect(),
                })
                .collect();
            let table_meta = TableMetaFile {
                next_rid: table.next_rid_value(),
                page_directory,
                page_ranges,
            };
            fs::write(
                table_dir.join("table_meta.json"),
                serde_json::to_vec(&table_meta).map_err(|e| DbError::Metadata(e.to_string()))?,
            )?;
        }
        Ok(())
    }

    /// Rejects a name collision with `DbError::Precondition` — stricter than
    /// the original's silent "return the existing table" (see DESIGN.md).
    pub fn create_table(&mut self, name: impl Into<String>, num_columns: usize, key_col: usize) -> DbResult<TableHandle> {
        let name = name.into();
        if self.tables.contains_key(&name) {
            return Err(DbError::Precondition(format!("table {name:?} already exists")));
        }
        let table = Table::new(name.clone(), num_columns, key_col, self.pool.clone(), self.config.merge_threshold);
        let handle = table.into_handle();
        self.tables.insert(name, handle.clone());
        Ok(handle)
    }

    pub fn drop_table(&mut self, name: &str) -> bool {
        self.tables.remove(name).is_some()
    }

    pub fn get_table(&self, name: &str) -> Option<TableHandle> {
        self.tables.get(name).cloned()
    }
}

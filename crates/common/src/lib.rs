use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Layout constants fixed by the on-disk page format; these must match across
/// every process that ever opens the same database directory.
pub mod constants {
    /// Bytes per page, header excluded.
    pub const PAGE_SIZE: usize = 4096;
    /// Bytes per stored 64-bit integer slot.
    pub const RECORD_SIZE: usize = 8;
    /// Slots per page: `PAGE_SIZE / RECORD_SIZE`.
    pub const RECORDS_PER_PAGE: usize = PAGE_SIZE / RECORD_SIZE;
    /// Base records per page range: 128 base pages worth.
    pub const RECORDS_PER_PAGE_RANGE: usize = RECORDS_PER_PAGE * 128;

    /// Metadata columns prefixed onto every physical record.
    pub const INDIRECTION_COLUMN: usize = 0;
    pub const RID_COLUMN: usize = 1;
    pub const TIMESTAMP_COLUMN: usize = 2;
    pub const SCHEMA_ENCODING_COLUMN: usize = 3;
    pub const NUM_META_COLS: usize = 4;

    /// Reserved RID meaning "no record".
    pub const NULL_RID: i64 = 0;

    pub const DEFAULT_BUFFERPOOL_CAPACITY: usize = 10_000;
    pub const DEFAULT_MERGE_THRESHOLD: u64 = 100_000;
}

/// Canonical error type shared across the storage engine's crates.
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("page is full")]
    PageFull,
    #[error("slot {0} out of range")]
    SlotOutOfRange(u16),
    #[error("unknown rid {0}")]
    UnknownRid(i64),
    #[error("unknown table {0:?}")]
    UnknownTable(String),
    #[error("unknown column {0}")]
    UnknownColumn(usize),
    #[error("precondition violated: {0}")]
    Precondition(String),
    #[error("merge failed: {0}")]
    Merge(String),
    #[error("corrupt metadata: {0}")]
    Metadata(String),
}

/// Result alias used throughout the engine's internal layers. The public
/// `Query`/`Table::create_index` boundary collapses `Precondition` failures
/// (and only those) down to `false`/`None` per the legacy contract.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for a `Database`.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .data_dir(PathBuf::from("./my_db"))
///     .build();
/// assert_eq!(config.buffer_pool_capacity, common::constants::DEFAULT_BUFFERPOOL_CAPACITY);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Directory where per-table data and metadata JSON files live.
    pub data_dir: PathBuf,
    /// Number of pages the buffer pool keeps resident before soft-growing.
    #[builder(default = constants::DEFAULT_BUFFERPOOL_CAPACITY)]
    pub buffer_pool_capacity: usize,
    /// Tail-record count per page range that triggers an asynchronous merge.
    #[builder(default = constants::DEFAULT_MERGE_THRESHOLD)]
    pub merge_threshold: u64,
}

/// Identifies a single on-disk page: which table, which range, base or tail,
/// which page index within that range, and which column.
///
/// Mirrors the 5-tuple `(table_name, range_index, is_tail, page_index,
/// column_index)` page identifier: every page the buffer pool manages is
/// addressed by one of these.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub table: Arc<str>,
    pub range_idx: usize,
    pub is_tail: bool,
    pub page_idx: usize,
    pub col_idx: usize,
}

impl PageKey {
    pub fn new(
        table: Arc<str>,
        range_idx: usize,
        is_tail: bool,
        page_idx: usize,
        col_idx: usize,
    ) -> Self {
        Self {
            table,
            range_idx,
            is_tail,
            page_idx,
            col_idx,
        }
    }

    /// Relative file path under the database directory for this page.
    pub fn relative_path(&self) -> PathBuf {
        let kind = if self.is_tail { "tail" } else { "base" };
        PathBuf::from(self.table.as_ref())
            .join(format!("page_range_{}", self.range_idx))
            .join(format!("{kind}_{}_{}.page", self.page_idx, self.col_idx))
    }
}

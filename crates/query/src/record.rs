use std::ops::Index;

/// A projected row returned from `select`/`select_version`: unprojected
/// columns read back as `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub rid: i64,
    pub key: i64,
    pub columns: Vec<Option<i64>>,
}

impl Record {
    pub fn new(rid: i64, key: i64, columns: Vec<Option<i64>>) -> Self {
        Self { rid, key, columns }
    }
}

impl Index<usize> for Record {
    type Output = Option<i64>;

    fn index(&self, col: usize) -> &Option<i64> {
        &self.columns[col]
    }
}

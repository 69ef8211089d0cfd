use common::constants::{PAGE_SIZE, RECORD_SIZE, RECORDS_PER_PAGE};
use common::{DbError, DbResult};

/// Fixed-size array of signed 64-bit integers backing every base and tail
/// column. A page never grows past `RECORDS_PER_PAGE` slots.
#[derive(Clone, Debug)]
pub struct Page {
    num_records: usize,
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    pub fn new() -> Self {
        Self {
            num_records: 0,
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    pub fn num_records(&self) -> usize {
        self.num_records
    }

    pub fn has_capacity(&self) -> bool {
        self.num_records < RECORDS_PER_PAGE
    }

    /// Appends `value` at `num_records`, returning its slot, or fails with
    /// `PageFull` once `RECORDS_PER_PAGE` is reached.
    pub fn append(&mut self, value: i64) -> DbResult<usize> {
        if !self.has_capacity() {
            return Err(DbError::PageFull);
        }
        let slot = self.num_records;
        self.write_slot(slot, value);
        self.num_records += 1;
        Ok(slot)
    }

    /// Overwrites `slot`, advancing `num_records` to `max(num_records, slot+1)`.
    /// Unlike `append`, this may be used to fill an already-written slot or
    /// the next free one.
    pub fn write_at(&mut self, slot: usize, value: i64) -> DbResult<()> {
        if slot >= RECORDS_PER_PAGE {
            return Err(DbError::SlotOutOfRange(slot as u16));
        }
        self.write_slot(slot, value);
        self.num_records = self.num_records.max(slot + 1);
        Ok(())
    }

    /// Reads the integer at `slot`. Undefined (but not unsafe) if
    /// `slot >= num_records` — callers must not read unwritten slots.
    pub fn read(&self, slot: usize) -> i64 {
        let offset = slot * RECORD_SIZE;
        i64::from_le_bytes(self.data[offset..offset + RECORD_SIZE].try_into().unwrap())
    }

    fn write_slot(&mut self, slot: usize, value: i64) {
        let offset = slot * RECORD_SIZE;
        self.data[offset..offset + RECORD_SIZE].copy_from_slice(&value.to_le_bytes());
    }

    /// On-disk layout: 8-byte little-endian `num_records` header followed by
    /// the full `PAGE_SIZE`-byte data buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + PAGE_SIZE);
        out.extend_from_slice(&(self.num_records as u64).to_le_bytes());
        out.extend_from_slice(self.data.as_ref());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> DbResult<Self> {
        if bytes.len() != 8 + PAGE_SIZE {
            return Err(DbError::Metadata(format!(
                "page file has {} bytes, expected {}",
                bytes.len(),
                8 + PAGE_SIZE
            )));
        }
        let num_records = u64::from_le_bytes(bytes[0..8].try_into().unwrap()) as usize;
        let mut data = Box::new([0u8; PAGE_SIZE]);
        data.copy_from_slice(&bytes[8..]);
        Ok(Self { num_records, data })
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_bumps_num_records_and_returns_slot() {
        let mut p = Page::new();
        assert_eq!(p.append(42).unwrap(), 0);
        assert_eq!(p.append(7).unwrap(), 1);
        assert_eq!(p.num_records(), 2);
        assert_eq!(p.read(0), 42);
        assert_eq!(p.read(1), 7);
    }

    #[test]
    fn page_full_at_513th_append() {
        let mut p = Page::new();
        for i in 0..RECORDS_PER_PAGE {
            p.append(i as i64).unwrap();
        }
        assert!(!p.has_capacity());
        assert!(matches!(p.append(0), Err(DbError::PageFull)));
    }

    #[test]
    fn write_at_advances_num_records_to_max() {
        let mut p = Page::new();
        p.write_at(5, 100).unwrap();
        assert_eq!(p.num_records(), 6);
        p.write_at(2, 200).unwrap();
        assert_eq!(p.num_records(), 6);
        assert_eq!(p.read(2), 200);
        assert_eq!(p.read(5), 100);
    }

    #[test]
    fn write_at_out_of_range_slot_errors() {
        let mut p = Page::new();
        assert!(matches!(
            p.write_at(RECORDS_PER_PAGE, 1),
            Err(DbError::SlotOutOfRange(_))
        ));
    }

    #[test]
    fn bytes_round_trip() {
        let mut p = Page::new();
        p.append(-5).unwrap();
        p.append(i64::MAX).unwrap();
        let bytes = p.to_bytes();
        assert_eq!(bytes.len(), 8 + PAGE_SIZE);
        let p2 = Page::from_bytes(&bytes).unwrap();
        assert_eq!(p2.num_records(), 2);
        assert_eq!(p2.read(0), -5);
        assert_eq!(p2.read(1), i64::MAX);
    }

    use proptest::prelude::*;

    proptest! {
        // Writing then reading any slot returns the written value, regardless
        // of the value's sign or magnitude.
        #[test]
        fn write_at_then_read_round_trips(slot in 0..RECORDS_PER_PAGE, value in any::<i64>()) {
            let mut p = Page::new();
            p.write_at(slot, value).unwrap();
            prop_assert_eq!(p.read(slot), value);
            prop_assert_eq!(p.num_records(), slot + 1);
        }

        // A full byte round-trip through to_bytes/from_bytes never loses or
        // reorders any written slot.
        #[test]
        fn to_bytes_from_bytes_preserves_every_slot(values in prop::collection::vec(any::<i64>(), 0..RECORDS_PER_PAGE)) {
            let mut p = Page::new();
            for &v in &values {
                p.append(v).unwrap();
            }
            let restored = Page::from_bytes(&p.to_bytes()).unwrap();
            prop_assert_eq!(restored.num_records(), values.len());
            for (slot, &v) in values.iter().enumerate() {
                prop_assert_eq!(restored.read(slot), v);
            }
        }
    }
}

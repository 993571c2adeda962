//! The page index: one fixed-size record per stored message, enabling
//! `seek` to binary-search for a starting point instead of scanning.

use crate::error::ChronopipeError;
use crate::store::extent::{ExtentReader, ExtentWriter, ReadOutcome};
use crate::store::{ExtentKind, StoreLayout};
use crate::time::Instant;

/// Size in bytes of one serialized [`IndexEntry`].
pub const INDEX_ENTRY_SIZE: usize = 24;

/// A fixed 24-byte record locating one stored message: `extent_id:i32,
/// position:i32, creation_time:i64, originating_time:i64`. A negative
/// `extent_id` means the payload lives in the large-data set, at extent id
/// `extent_id - i32::MIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Extent id holding the payload (data extent if non-negative).
    pub extent_id: i32,
    /// Byte offset of the block's size header within that extent.
    pub position: i32,
    /// Wall-clock stamp at write time.
    pub creation_time: Instant,
    /// The sole correctness-relevant clock reading.
    pub originating_time: Instant,
}

impl IndexEntry {
    /// Creates an entry pointing at the main data set.
    #[must_use]
    pub const fn in_data(extent_id: u32, position: u32, creation_time: Instant, originating_time: Instant) -> Self {
        Self {
            extent_id: extent_id as i32,
            position: position as i32,
            creation_time,
            originating_time,
        }
    }

    /// Creates an entry pointing at the large-data set.
    #[must_use]
    pub fn in_large_data(extent_id: u32, position: u32, creation_time: Instant, originating_time: Instant) -> Self {
        Self {
            extent_id: i32::MIN + extent_id as i32,
            position: position as i32,
            creation_time,
            originating_time,
        }
    }

    /// True if this entry's payload lives in the large-data set rather than
    /// the main data extents.
    #[must_use]
    pub fn is_large(&self) -> bool {
        self.extent_id < 0
    }

    /// The data-set extent id this entry resolves to, accounting for the
    /// large-data encoding.
    #[must_use]
    pub fn resolved_extent_id(&self) -> u32 {
        if self.is_large() {
            (self.extent_id.wrapping_sub(i32::MIN)) as u32
        } else {
            self.extent_id as u32
        }
    }

    /// Serializes to the fixed 24-byte on-disk layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.extent_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.position.to_le_bytes());
        buf[8..16].copy_from_slice(&self.creation_time.ticks().to_le_bytes());
        buf[16..24].copy_from_slice(&self.originating_time.ticks().to_le_bytes());
        buf
    }

    /// Parses an entry from its fixed 24-byte on-disk layout.
    #[must_use]
    pub fn from_bytes(buf: &[u8; INDEX_ENTRY_SIZE]) -> Self {
        Self {
            extent_id: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            position: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            creation_time: Instant::from_ticks(i64::from_le_bytes(buf[8..16].try_into().unwrap())),
            originating_time: Instant::from_ticks(i64::from_le_bytes(buf[16..24].try_into().unwrap())),
        }
    }
}

/// Appends [`IndexEntry`] records to a store's index extent family.
pub struct IndexWriter {
    writer: ExtentWriter,
}

impl IndexWriter {
    /// Opens the index extent family for appending.
    pub fn create(layout: StoreLayout, max_extent_bytes: u64) -> crate::error::ChronopipeResult<Self> {
        Ok(Self {
            writer: ExtentWriter::create(layout, ExtentKind::Index, max_extent_bytes)?,
        })
    }

    /// Appends one entry.
    pub fn append(&mut self, entry: &IndexEntry) -> crate::error::ChronopipeResult<()> {
        self.writer.append(&entry.to_bytes()).map(|_| ())
    }
}

/// An immutable, binary-searchable cache of every index entry in a store,
/// built once at open time by reading the index extent family through to
/// exhaustion.
#[derive(Debug, Clone, Default)]
pub struct PageIndexCache {
    entries: Vec<IndexEntry>,
}

impl PageIndexCache {
    /// Reads every committed entry from the index extent family into an
    /// in-memory, originating-time-sorted cache.
    pub fn build(layout: StoreLayout) -> crate::error::ChronopipeResult<Self> {
        let mut reader = ExtentReader::open(layout, ExtentKind::Index, 0, 0)?;
        let mut entries = Vec::new();
        loop {
            match reader.read_next()? {
                ReadOutcome::Block(block) => {
                    let bytes: [u8; INDEX_ENTRY_SIZE] = block.payload.as_slice().try_into().map_err(|_| {
                        ChronopipeError::IndexCorrupt(format!("index block has {} bytes, expected {INDEX_ENTRY_SIZE}", block.payload.len()))
                    })?;
                    entries.push(IndexEntry::from_bytes(&bytes));
                }
                ReadOutcome::Pending => break,
            }
        }
        entries.sort_by_key(|e| e.originating_time);
        Ok(Self { entries })
    }

    /// Number of entries in the cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary-searches for the greatest entry with `originating_time <= t`,
    /// the starting point `seek` resolves to.
    #[must_use]
    pub fn seek(&self, t: Instant) -> Option<IndexEntry> {
        let idx = self.entries.partition_point(|e| e.originating_time <= t);
        if idx == 0 {
            None
        } else {
            Some(self.entries[idx - 1])
        }
    }

    /// All entries with `originating_time` in `[start, end]`, in order.
    #[must_use]
    pub fn range(&self, start: Instant, end: Instant) -> &[IndexEntry] {
        let lo = self.entries.partition_point(|e| e.originating_time < start);
        let hi = self.entries.partition_point(|e| e.originating_time <= end);
        &self.entries[lo..hi]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreLayout;

    fn entry(t: i64) -> IndexEntry {
        IndexEntry::in_data(0, t as u32 * 8, Instant::from_ticks(t), Instant::from_ticks(t))
    }

    #[test]
    fn entry_round_trips_through_bytes() {
        let e = entry(42);
        assert_eq!(IndexEntry::from_bytes(&e.to_bytes()), e);
    }

    #[test]
    fn large_data_entries_resolve_their_extent_id() {
        let e = IndexEntry::in_large_data(3, 0, Instant::from_ticks(0), Instant::from_ticks(0));
        assert!(e.is_large());
        assert_eq!(e.resolved_extent_id(), 3);
    }

    #[test]
    fn cache_seek_finds_greatest_entry_at_or_before_target() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "s");
        let mut writer = IndexWriter::create(layout.clone(), 1 << 20).unwrap();
        for t in [10, 20, 30, 40] {
            writer.append(&entry(t)).unwrap();
        }

        let cache = PageIndexCache::build(layout).unwrap();
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.seek(Instant::from_ticks(25)).unwrap().originating_time, Instant::from_ticks(20));
        assert_eq!(cache.seek(Instant::from_ticks(5)), None);
        assert_eq!(cache.seek(Instant::from_ticks(40)).unwrap().originating_time, Instant::from_ticks(40));
    }

    #[test]
    fn cache_range_is_inclusive_of_both_ends() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "s");
        let mut writer = IndexWriter::create(layout.clone(), 1 << 20).unwrap();
        for t in [10, 20, 30, 40] {
            writer.append(&entry(t)).unwrap();
        }
        let cache = PageIndexCache::build(layout).unwrap();
        let range = cache.range(Instant::from_ticks(20), Instant::from_ticks(30));
        assert_eq!(range.len(), 2);
    }
}

//! The Psi store reader: random and sequential access over a store written
//! by [`crate::store::exporter::StoreExporter`], without ever loading the
//! whole data set into memory.

use crate::envelope::{Envelope, ENVELOPE_SIZE};
use crate::error::{ChronopipeError, ChronopipeResult};
use crate::store::catalog::{CatalogCache, StreamMetadata};
use crate::store::exporter::{StoreExporter, BLOCK_KIND_INLINE, BLOCK_KIND_POINTER};
use crate::store::extent::{ExtentReader, ReadOutcome};
use crate::store::index::{IndexEntry, PageIndexCache};
use crate::store::live_marker::LiveMarker;
use crate::store::{ExtentKind, StoreLayout};
use crate::time::Instant;

const STREAM_TAG_SIZE: usize = 4;

/// Splits a block into its stream id, its block-kind byte, and the
/// remaining content (either an envelope + payload, or a pointer record).
fn split_tag(bytes: &[u8]) -> ChronopipeResult<(u32, u8, &[u8])> {
    if bytes.len() < STREAM_TAG_SIZE + 1 {
        return Err(ChronopipeError::IndexCorrupt(format!("block of {} bytes is smaller than the stream tag", bytes.len())));
    }
    let stream_id = u32::from_le_bytes(bytes[0..STREAM_TAG_SIZE].try_into().unwrap());
    let kind = bytes[STREAM_TAG_SIZE];
    Ok((stream_id, kind, &bytes[STREAM_TAG_SIZE + 1..]))
}

/// Splits an inline block's content into its envelope and payload.
fn split_envelope(bytes: &[u8]) -> ChronopipeResult<(Envelope, &[u8])> {
    if bytes.len() < ENVELOPE_SIZE {
        return Err(ChronopipeError::IndexCorrupt(format!("inline block of {} bytes is smaller than an envelope", bytes.len())));
    }
    let buf: [u8; ENVELOPE_SIZE] = bytes[0..ENVELOPE_SIZE].try_into().unwrap();
    Ok((Envelope::from_bytes(&buf), &bytes[ENVELOPE_SIZE..]))
}

/// A bounded time interval used for seeking and reporting store coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    /// Inclusive left bound.
    pub left: Instant,
    /// Inclusive right bound.
    pub right: Instant,
}

impl TimeInterval {
    /// Builds an interval.
    #[must_use]
    pub const fn new(left: Instant, right: Instant) -> Self {
        Self { left, right }
    }
}

/// Reads a store written by [`StoreExporter`]: sequential playback, random
/// access by index entry, and raw stream copy without deserialization.
pub struct StoreImporter {
    layout: StoreLayout,
    catalog: CatalogCache,
    page_index: PageIndexCache,
    data: ExtentReader,
    enabled_streams: std::collections::HashSet<u32>,
}

impl StoreImporter {
    /// Opens a store for reading: builds the catalog and page-index caches
    /// and positions a data reader at the start of extent 0.
    pub fn open(root: impl Into<std::path::PathBuf>, name: impl Into<String>) -> ChronopipeResult<Self> {
        let layout = StoreLayout::new(root, name.into());
        let catalog = CatalogCache::build(layout.clone())?;
        let page_index = PageIndexCache::build(layout.clone())?;
        let data = ExtentReader::open(layout.clone(), ExtentKind::Data, 0, 0)?;
        Ok(Self {
            layout,
            catalog,
            page_index,
            data,
            enabled_streams: std::collections::HashSet::new(),
        })
    }

    /// Names of every stream recorded in the catalog.
    #[must_use]
    pub fn available_streams(&self) -> Vec<&str> {
        self.catalog.available_streams()
    }

    /// Number of streams recorded in the catalog.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.catalog.streams.len()
    }

    /// The union of every stream's observed creation-time range.
    #[must_use]
    pub fn message_creation_time_interval(&self) -> Option<TimeInterval> {
        self.time_interval_over(|s| (s.first_originating_time, s.last_originating_time))
    }

    /// The union of every stream's observed originating-time range.
    #[must_use]
    pub fn message_originating_time_interval(&self) -> Option<TimeInterval> {
        self.time_interval_over(|s| (s.first_originating_time, s.last_originating_time))
    }

    /// A single stream's observed originating-time range.
    #[must_use]
    pub fn stream_time_interval(&self, name: &str) -> Option<TimeInterval> {
        let meta = self.catalog.stream_by_name(name)?;
        Some(TimeInterval::new(meta.first_originating_time?, meta.last_originating_time?))
    }

    fn time_interval_over(&self, bounds: impl Fn(&StreamMetadata) -> (Option<Instant>, Option<Instant>)) -> Option<TimeInterval> {
        let mut left = None;
        let mut right = None;
        for meta in self.catalog.streams.values() {
            let (lo, hi) = bounds(meta);
            if let Some(lo) = lo {
                left = Some(left.map_or(lo, |l: Instant| l.min(lo)));
            }
            if let Some(hi) = hi {
                right = Some(right.map_or(hi, |r: Instant| r.max(hi)));
            }
        }
        Some(TimeInterval::new(left?, right?))
    }

    /// Total number of page-index entries recorded (a coarse proxy for the
    /// store's size in messages covered by the index).
    #[must_use]
    pub fn size(&self) -> usize {
        self.page_index.len()
    }

    /// Enables `name` for reads, returning its catalog metadata.
    pub fn open_stream(&mut self, name: &str) -> ChronopipeResult<StreamMetadata> {
        let meta = self
            .catalog
            .stream_by_name(name)
            .cloned()
            .ok_or_else(|| ChronopipeError::StoreNotFound(format!("no stream named '{name}' in store '{}'", self.layout.name())))?;
        self.enabled_streams.insert(meta.id);
        Ok(meta)
    }

    /// Binary-searches the page index for the greatest entry at or before
    /// `interval.left` and positions the sequential cursor there.
    pub fn seek(&mut self, interval: TimeInterval) -> ChronopipeResult<()> {
        match self.page_index.seek(interval.left) {
            Some(entry) => self.data.seek_to(entry.resolved_extent_id(), entry.position as u64),
            None => self.data.seek_to(0, 0),
        }
    }

    /// Reads the next message belonging to an opened stream, together with
    /// the envelope it was written with, following an index-entry pointer
    /// into the large-data set when present, and skipping blocks for
    /// streams that have not been opened.
    ///
    /// Returns `Ok(None)` once the cursor reaches a pending ("no more yet")
    /// sentinel.
    pub fn read(&mut self) -> ChronopipeResult<Option<(Envelope, Vec<u8>)>> {
        loop {
            let block = match self.data.read_next()? {
                ReadOutcome::Block(block) => block,
                ReadOutcome::Pending => return Ok(None),
            };
            let (stream_id, kind, rest) = split_tag(&block.payload)?;
            if !self.enabled_streams.is_empty() && !self.enabled_streams.contains(&stream_id) {
                continue;
            }
            return match kind {
                BLOCK_KIND_INLINE => {
                    let (envelope, payload) = split_envelope(rest)?;
                    Ok(Some((envelope, payload.to_vec())))
                }
                BLOCK_KIND_POINTER => {
                    let bytes: [u8; crate::store::index::INDEX_ENTRY_SIZE] = rest.try_into().map_err(|_| {
                        ChronopipeError::IndexCorrupt(format!(
                            "pointer block has {} bytes, expected {}",
                            rest.len(),
                            crate::store::index::INDEX_ENTRY_SIZE
                        ))
                    })?;
                    let entry = IndexEntry::from_bytes(&bytes);
                    Ok(Some(self.read_at(&entry)?))
                }
                other => Err(ChronopipeError::IndexCorrupt(format!("unknown block kind {other}"))),
            };
        }
    }

    /// Random-access read of the message an index entry points to, without
    /// disturbing the sequential cursor.
    pub fn read_at(&self, entry: &IndexEntry) -> ChronopipeResult<(Envelope, Vec<u8>)> {
        let kind = if entry.is_large() { ExtentKind::LargeData } else { ExtentKind::Data };
        let reader = ExtentReader::open(self.layout.clone(), kind, entry.resolved_extent_id(), 0)?;
        let tagged = reader.read_at(entry.resolved_extent_id(), entry.position as u64)?;
        let (_, block_kind, rest) = split_tag(&tagged)?;
        if block_kind != BLOCK_KIND_INLINE {
            return Err(ChronopipeError::IndexCorrupt(format!("index entry pointed at a non-inline block (kind {block_kind})")));
        }
        let (envelope, payload) = split_envelope(rest)?;
        Ok((envelope, payload.to_vec()))
    }

    /// True iff this store's live marker file is present and currently held
    /// exclusively by a writer.
    #[must_use]
    pub fn is_live(&self) -> bool {
        LiveMarker::is_live(&self.layout)
    }

    /// Streams every message of `name` into `exporter`, preserving each
    /// message's original envelope rather than re-minting one. `exporter`
    /// must already have `name` opened with matching indexing.
    pub fn copy_stream(&mut self, name: &str, exporter: &mut StoreExporter, type_name: &str, is_indexed: bool) -> ChronopipeResult<u64> {
        self.open_stream(name)?;
        exporter.open_stream(name, type_name, is_indexed)?;
        self.seek(TimeInterval::new(Instant::MIN, Instant::MAX))?;
        let mut copied = 0u64;
        while let Some((envelope, payload)) = self.read()? {
            exporter.write(name, envelope, &payload)?;
            copied += 1;
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    fn write_sample_store(dir: &std::path::Path) {
        let mut exporter = StoreExporter::create(dir, "s").unwrap();
        exporter.open_stream("temp", "f32", false).unwrap();
        for t in 1..=5i64 {
            let env = Envelope::new(0, t as u64, Instant::from_ticks(t), Instant::from_ticks(t));
            exporter.write("temp", env, format!("v{t}").as_bytes()).unwrap();
        }
    }

    #[test]
    fn open_then_read_recovers_every_message_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_store(dir.path());

        let mut importer = StoreImporter::open(dir.path(), "s").unwrap();
        assert_eq!(importer.available_streams(), vec!["temp"]);
        importer.open_stream("temp").unwrap();

        let mut seen = Vec::new();
        while let Some((_, payload)) = importer.read().unwrap() {
            seen.push(String::from_utf8(payload).unwrap());
        }
        assert_eq!(seen, vec!["v1", "v2", "v3", "v4", "v5"]);
    }

    #[test]
    fn read_recovers_the_original_envelope_bit_for_bit() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = StoreExporter::create(dir.path(), "s").unwrap();
        exporter.open_stream("temp", "f32", false).unwrap();
        let written = Envelope::new(3, 7, Instant::from_ticks(42), Instant::from_ticks(43));
        exporter.write("temp", written, b"v").unwrap();
        drop(exporter);

        let mut importer = StoreImporter::open(dir.path(), "s").unwrap();
        importer.open_stream("temp").unwrap();
        let (envelope, payload) = importer.read().unwrap().expect("one message");
        assert_eq!(envelope, written);
        assert_eq!(payload, b"v");
    }

    #[test]
    fn copy_stream_preserves_original_envelopes() {
        let src_dir = tempfile::tempdir().unwrap();
        write_sample_store(src_dir.path());
        let mut importer = StoreImporter::open(src_dir.path(), "s").unwrap();

        let dst_dir = tempfile::tempdir().unwrap();
        let mut exporter = StoreExporter::create(dst_dir.path(), "copy").unwrap();
        let copied = importer.copy_stream("temp", &mut exporter, "f32", false).unwrap();
        assert_eq!(copied, 5);
        drop(exporter);

        let mut check = StoreImporter::open(dst_dir.path(), "copy").unwrap();
        check.open_stream("temp").unwrap();
        let (envelope, payload) = check.read().unwrap().expect("one message");
        assert_eq!(envelope.originating_time, Instant::from_ticks(1));
        assert_eq!(payload, b"v1");
    }

    #[test]
    fn open_unknown_stream_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_store(dir.path());
        let mut importer = StoreImporter::open(dir.path(), "s").unwrap();
        let err = importer.open_stream("missing").unwrap_err();
        assert!(matches!(err, ChronopipeError::StoreNotFound(_)));
    }

    #[test]
    fn is_live_reflects_an_open_exporter() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = StoreExporter::create(dir.path(), "s").unwrap();
        let importer = StoreImporter::open(dir.path(), "s").unwrap();
        assert!(importer.is_live());
        drop(exporter);
        assert!(!importer.is_live());
    }

    #[test]
    fn read_skips_blocks_of_streams_that_were_not_opened() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = StoreExporter::create(dir.path(), "s").unwrap();
        exporter.open_stream("temp", "f32", false).unwrap();
        exporter.open_stream("pressure", "f32", false).unwrap();
        for t in 1..=3i64 {
            let env = Envelope::new(0, t as u64, Instant::from_ticks(t), Instant::from_ticks(t));
            exporter.write("temp", env, format!("t{t}").as_bytes()).unwrap();
            exporter.write("pressure", env, format!("p{t}").as_bytes()).unwrap();
        }
        drop(exporter);

        let mut importer = StoreImporter::open(dir.path(), "s").unwrap();
        importer.open_stream("temp").unwrap();
        let mut seen = Vec::new();
        while let Some((_, payload)) = importer.read().unwrap() {
            seen.push(String::from_utf8(payload).unwrap());
        }
        assert_eq!(seen, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn round_trip_large_payload_through_large_data_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = StoreExporter::create(dir.path(), "s").unwrap();
        exporter.open_stream("frames", "bytes", true).unwrap();
        let big = vec![9u8; crate::store::exporter::LARGE_MESSAGE_THRESHOLD + 100];
        let env = Envelope::new(0, 1, Instant::from_ticks(1), Instant::from_ticks(1));
        exporter.write("frames", env, &big).unwrap();
        drop(exporter);

        let mut importer = StoreImporter::open(dir.path(), "s").unwrap();
        importer.open_stream("frames").unwrap();
        let (recovered, payload) = importer.read().unwrap().expect("one message");
        assert_eq!(recovered, env);
        assert_eq!(payload, big);
    }
}

//! The Psi store writer: the multi-stream recording surface wiring
//! together the catalog, page index, data, and large-data extent families.

use std::collections::HashMap;

use crate::envelope::Envelope;
use crate::error::ChronopipeResult;
use crate::store::catalog::{CatalogWriter, StreamMetadata, TypeSchema};
use crate::store::extent::ExtentWriter;
use crate::store::index::{IndexEntry, IndexWriter};
use crate::store::live_marker::LiveMarker;
use crate::store::{ExtentKind, StoreLayout};

/// Default extent capacity: 64 MiB per extent before rolling over.
pub const DEFAULT_MAX_EXTENT_BYTES: u64 = 64 * 1024 * 1024;

/// Payloads larger than this are written to the large-data set instead of
/// inline, for streams opened with `is_indexed = true`.
pub const LARGE_MESSAGE_THRESHOLD: usize = 4096;

/// The index accumulates a new page-index entry once this many bytes have
/// been written to the data set since the last one.
pub const PAGE_SIZE: u64 = 4096;

/// Size in bytes of the stream-id tag prefixed to every data-file block, so
/// a reader walking an interleaved multi-stream data set can skip blocks
/// belonging to streams it has not opened without deserializing them.
const STREAM_TAG_SIZE: usize = 4;

/// Block-kind byte following the stream-id tag: an inline message carries
/// its envelope and payload verbatim; a pointer block carries an
/// [`IndexEntry`] locating the real block in the large-data set.
pub(crate) const BLOCK_KIND_INLINE: u8 = 0;
pub(crate) const BLOCK_KIND_POINTER: u8 = 1;

/// Tags a message block with its stream id, the inline-kind byte, and the
/// message's envelope ahead of the payload, so a reader can recover the
/// original `source_id`/`sequence_id`/`originating_time` without consulting
/// the index.
fn tag_inline_block(stream_id: u32, envelope: &Envelope, payload: &[u8]) -> Vec<u8> {
    let mut tagged = Vec::with_capacity(STREAM_TAG_SIZE + 1 + crate::envelope::ENVELOPE_SIZE + payload.len());
    tagged.extend_from_slice(&stream_id.to_le_bytes());
    tagged.push(BLOCK_KIND_INLINE);
    tagged.extend_from_slice(&envelope.to_bytes());
    tagged.extend_from_slice(payload);
    tagged
}

/// Tags a large-data pointer record with its stream id and the pointer-kind
/// byte, so a reader can tell it apart from an inline block of the same
/// stream without relying on its length.
fn tag_pointer_block(stream_id: u32, pointer: &IndexEntry) -> Vec<u8> {
    let mut tagged = Vec::with_capacity(STREAM_TAG_SIZE + 1 + crate::store::index::INDEX_ENTRY_SIZE);
    tagged.extend_from_slice(&stream_id.to_le_bytes());
    tagged.push(BLOCK_KIND_POINTER);
    tagged.extend_from_slice(&pointer.to_bytes());
    tagged
}

struct StreamWriteState {
    id: u32,
    is_indexed: bool,
    type_schema_id: u32,
    message_count: u64,
    first_originating_time: Option<crate::time::Instant>,
    last_originating_time: Option<crate::time::Instant>,
}

/// Writes messages for one or more named streams into a store.
pub struct StoreExporter {
    layout: StoreLayout,
    catalog: CatalogWriter,
    index: IndexWriter,
    data: ExtentWriter,
    large_data: ExtentWriter,
    streams: HashMap<String, StreamWriteState>,
    type_ids: HashMap<String, u32>,
    next_stream_id: u32,
    next_type_id: u32,
    bytes_since_last_index_entry: u64,
    _live_marker: LiveMarker,
}

impl StoreExporter {
    /// Creates (or appends to) a store named `name` rooted at `root`,
    /// acquiring its live marker for the exporter's lifetime.
    pub fn create(root: impl Into<std::path::PathBuf>, name: impl Into<String>) -> ChronopipeResult<Self> {
        let name = name.into();
        let layout = StoreLayout::new(root, name.clone());
        let live_marker = LiveMarker::acquire(&layout)?;
        let catalog = CatalogWriter::create(layout.clone(), &name, DEFAULT_MAX_EXTENT_BYTES)?;
        let index = IndexWriter::create(layout.clone(), DEFAULT_MAX_EXTENT_BYTES)?;
        let data = ExtentWriter::create(layout.clone(), ExtentKind::Data, DEFAULT_MAX_EXTENT_BYTES)?;
        let large_data = ExtentWriter::create(layout.clone(), ExtentKind::LargeData, DEFAULT_MAX_EXTENT_BYTES)?;
        Ok(Self {
            layout,
            catalog,
            index,
            data,
            large_data,
            streams: HashMap::new(),
            type_ids: HashMap::new(),
            next_stream_id: 0,
            next_type_id: 0,
            bytes_since_last_index_entry: 0,
            _live_marker: live_marker,
        })
    }

    /// This exporter's store layout.
    #[must_use]
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Declares a stream, recording its `type_name` schema (if new) and
    /// initial metadata in the catalog. `is_indexed` enables large-message
    /// routing for payloads over [`LARGE_MESSAGE_THRESHOLD`].
    pub fn open_stream(&mut self, name: &str, type_name: &str, is_indexed: bool) -> ChronopipeResult<u32> {
        if let Some(state) = self.streams.get(name) {
            return Ok(state.id);
        }
        let type_schema_id = *self.type_ids.entry(type_name.to_string()).or_insert_with(|| {
            let id = self.next_type_id;
            self.next_type_id += 1;
            id
        });
        self.catalog.append_type_schema(TypeSchema {
            id: type_schema_id,
            type_name: type_name.to_string(),
        })?;

        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.insert(
            name.to_string(),
            StreamWriteState {
                id,
                is_indexed,
                type_schema_id,
                message_count: 0,
                first_originating_time: None,
                last_originating_time: None,
            },
        );
        self.catalog.append_stream_metadata(StreamMetadata {
            id,
            name: name.to_string(),
            type_schema_id,
            first_originating_time: None,
            last_originating_time: None,
            message_count: 0,
        })?;
        Ok(id)
    }

    /// Writes one message for `stream`, routing it to the large-data set
    /// when the stream is indexed and the payload exceeds
    /// [`LARGE_MESSAGE_THRESHOLD`], and accumulating a page-index entry
    /// whenever [`PAGE_SIZE`] bytes have been written since the last one.
    pub fn write(&mut self, stream: &str, envelope: Envelope, payload: &[u8]) -> ChronopipeResult<()> {
        let state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| crate::error::ChronopipeError::StoreNotFound(format!("stream '{stream}' was not opened")))?;

        state.message_count += 1;
        state.first_originating_time.get_or_insert(envelope.originating_time);
        state.last_originating_time = Some(envelope.originating_time);
        let type_schema_id = state.type_schema_id;
        let is_indexed = state.is_indexed;
        let id = state.id;
        let message_count = state.message_count;
        let first = state.first_originating_time;
        let last = state.last_originating_time;

        let (block_extent, block_position, block_len) = if is_indexed && payload.len() > LARGE_MESSAGE_THRESHOLD {
            let large_block = tag_inline_block(id, &envelope, payload);
            let (large_extent, large_position) = self.large_data.append(&large_block)?;
            let pointer_entry = IndexEntry::in_large_data(large_extent, large_position as u32, envelope.creation_time, envelope.originating_time);
            let tagged = tag_pointer_block(id, &pointer_entry);
            let len = tagged.len();
            let (e, p) = self.data.append(&tagged)?;
            (e, p, len)
        } else {
            let tagged = tag_inline_block(id, &envelope, payload);
            let len = tagged.len();
            let (e, p) = self.data.append(&tagged)?;
            (e, p, len)
        };

        self.bytes_since_last_index_entry += crate::store::padded_len(block_len) as u64 + 4;
        if self.bytes_since_last_index_entry >= PAGE_SIZE {
            self.index.append(&IndexEntry::in_data(
                block_extent,
                block_position as u32,
                envelope.creation_time,
                envelope.originating_time,
            ))?;
            self.bytes_since_last_index_entry = 0;
        }

        self.catalog.append_stream_metadata(StreamMetadata {
            id,
            name: stream.to_string(),
            type_schema_id,
            first_originating_time: first,
            last_originating_time: last,
            message_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Instant;

    #[test]
    fn open_stream_is_idempotent_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = StoreExporter::create(dir.path(), "s").unwrap();
        let a = exporter.open_stream("temp", "f32", false).unwrap();
        let b = exporter.open_stream("temp", "f32", false).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn write_routes_large_payloads_to_the_large_data_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = StoreExporter::create(dir.path(), "s").unwrap();
        exporter.open_stream("frames", "bytes", true).unwrap();
        let big = vec![7u8; LARGE_MESSAGE_THRESHOLD + 1];
        let env = Envelope::new(0, 0, Instant::from_ticks(1), Instant::from_ticks(1));
        exporter.write("frames", env, &big).unwrap();

        let cache = crate::store::catalog::CatalogCache::build(exporter.layout().clone()).unwrap();
        let meta = cache.stream_by_name("frames").unwrap();
        assert_eq!(meta.message_count, 1);
    }

    #[test]
    fn write_to_unopened_stream_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut exporter = StoreExporter::create(dir.path(), "s").unwrap();
        let env = Envelope::new(0, 0, Instant::from_ticks(1), Instant::from_ticks(1));
        let err = exporter.write("missing", env, b"x").unwrap_err();
        assert!(matches!(err, crate::error::ChronopipeError::StoreNotFound(_)));
    }
}

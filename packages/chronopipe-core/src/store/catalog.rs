//! Catalog records: the store's self-describing header plus per-stream
//! metadata, length-prefixed the same way every other extent block is.

use serde::{Deserialize, Serialize};

use crate::error::{ChronopipeError, ChronopipeResult};
use crate::store::extent::{ExtentReader, ExtentWriter, ReadOutcome};
use crate::store::{ExtentKind, StoreLayout};
use crate::time::Instant;

/// The format-version header, always the first record in a catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// Catalog/index/data format version this store was written with.
    pub format_version: u32,
    /// Name of the store as given at creation.
    pub store_name: String,
}

/// A recorded type's schema, identified by id for compact stream-metadata
/// references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeSchema {
    /// Id assigned to this type within the store.
    pub id: u32,
    /// The type's fully-qualified name, as recorded by the writer.
    pub type_name: String,
}

/// Per-stream metadata. May be appended multiple times under the same
/// `id` as a stream's observed time range grows; the last record for a
/// given id is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamMetadata {
    /// Stream id, stable for the lifetime of the store.
    pub id: u32,
    /// Stream name, unique within the store.
    pub name: String,
    /// Id of this stream's [`TypeSchema`] record.
    pub type_schema_id: u32,
    /// Earliest originating time observed for this stream, if any.
    pub first_originating_time: Option<Instant>,
    /// Latest originating time observed for this stream, if any.
    pub last_originating_time: Option<Instant>,
    /// Number of messages written for this stream so far.
    pub message_count: u64,
}

/// The three catalog record kinds, tagged for length-prefixed storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum CatalogRecord {
    /// The store's format-version header; always first.
    RuntimeInfo(RuntimeInfo),
    /// A recorded type's schema.
    TypeSchema(TypeSchema),
    /// Per-stream metadata, possibly superseding an earlier record for the
    /// same stream id.
    StreamMetadata(StreamMetadata),
}

/// The current catalog/index/data format version this crate writes.
pub const FORMAT_VERSION: u32 = 1;

/// Appends [`CatalogRecord`]s to a store's catalog extent family.
pub struct CatalogWriter {
    writer: ExtentWriter,
}

impl CatalogWriter {
    /// Opens the catalog extent family for appending. If the family is
    /// empty, writes the `runtime_info` header record first.
    pub fn create(layout: StoreLayout, store_name: &str, max_extent_bytes: u64) -> ChronopipeResult<Self> {
        let mut writer = ExtentWriter::create(layout.clone(), ExtentKind::Catalog, max_extent_bytes)?;
        if writer.tail_position() == 0 && writer.current_extent_id() == 0 {
            let header = CatalogRecord::RuntimeInfo(RuntimeInfo {
                format_version: FORMAT_VERSION,
                store_name: store_name.to_string(),
            });
            Self::write_record(&mut writer, &header)?;
        }
        Ok(Self { writer })
    }

    fn write_record(writer: &mut ExtentWriter, record: &CatalogRecord) -> ChronopipeResult<()> {
        let bytes = serde_json::to_vec(record).map_err(|e| ChronopipeError::CatalogCorrupt(e.to_string()))?;
        writer.append(&bytes).map(|_| ())
    }

    /// Appends a `type_schema` record.
    pub fn append_type_schema(&mut self, schema: TypeSchema) -> ChronopipeResult<()> {
        Self::write_record(&mut self.writer, &CatalogRecord::TypeSchema(schema))
    }

    /// Appends a `stream_metadata` record, superseding any earlier record
    /// for the same stream id on read.
    pub fn append_stream_metadata(&mut self, metadata: StreamMetadata) -> ChronopipeResult<()> {
        Self::write_record(&mut self.writer, &CatalogRecord::StreamMetadata(metadata))
    }
}

/// The catalog's materialized view: the header, every type schema, and the
/// latest metadata per stream.
#[derive(Debug, Clone, Default)]
pub struct CatalogCache {
    /// The store's format-version header, if the catalog has been written.
    pub runtime_info: Option<RuntimeInfo>,
    /// Type schemas by id.
    pub type_schemas: std::collections::HashMap<u32, TypeSchema>,
    /// The latest stream-metadata record per stream id.
    pub streams: std::collections::HashMap<u32, StreamMetadata>,
}

impl CatalogCache {
    /// Reads the full catalog extent family, folding repeated
    /// `stream_metadata` records down to the last one per id.
    pub fn build(layout: StoreLayout) -> ChronopipeResult<Self> {
        let mut reader = ExtentReader::open(layout, ExtentKind::Catalog, 0, 0)?;
        let mut cache = Self::default();
        loop {
            match reader.read_next()? {
                ReadOutcome::Block(block) => {
                    let record: CatalogRecord = serde_json::from_slice(&block.payload)
                        .map_err(|e| ChronopipeError::CatalogCorrupt(e.to_string()))?;
                    match record {
                        CatalogRecord::RuntimeInfo(info) => cache.runtime_info = Some(info),
                        CatalogRecord::TypeSchema(schema) => {
                            cache.type_schemas.insert(schema.id, schema);
                        }
                        CatalogRecord::StreamMetadata(meta) => {
                            cache.streams.insert(meta.id, meta);
                        }
                    }
                }
                ReadOutcome::Pending => break,
            }
        }
        if cache.runtime_info.is_none() {
            return Err(ChronopipeError::CatalogCorrupt("catalog has no runtime_info header".to_string()));
        }
        Ok(cache)
    }

    /// Stream names in this catalog, for `available_streams`.
    #[must_use]
    pub fn available_streams(&self) -> Vec<&str> {
        self.streams.values().map(|s| s.name.as_str()).collect()
    }

    /// Looks up a stream's metadata by name.
    #[must_use]
    pub fn stream_by_name(&self, name: &str) -> Option<&StreamMetadata> {
        self.streams.values().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreLayout;

    #[test]
    fn writer_then_cache_resolves_latest_stream_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "s");
        let mut writer = CatalogWriter::create(layout.clone(), "s", 1 << 20).unwrap();
        writer
            .append_type_schema(TypeSchema {
                id: 1,
                type_name: "f32".to_string(),
            })
            .unwrap();
        writer
            .append_stream_metadata(StreamMetadata {
                id: 1,
                name: "temperature".to_string(),
                type_schema_id: 1,
                first_originating_time: Some(Instant::from_ticks(0)),
                last_originating_time: Some(Instant::from_ticks(10)),
                message_count: 5,
            })
            .unwrap();
        writer
            .append_stream_metadata(StreamMetadata {
                id: 1,
                name: "temperature".to_string(),
                type_schema_id: 1,
                first_originating_time: Some(Instant::from_ticks(0)),
                last_originating_time: Some(Instant::from_ticks(20)),
                message_count: 9,
            })
            .unwrap();

        let cache = CatalogCache::build(layout).unwrap();
        assert_eq!(cache.runtime_info.as_ref().unwrap().format_version, FORMAT_VERSION);
        assert_eq!(cache.type_schemas.len(), 1);
        let stream = cache.stream_by_name("temperature").unwrap();
        assert_eq!(stream.message_count, 9);
        assert_eq!(stream.last_originating_time, Some(Instant::from_ticks(20)));
    }

    #[test]
    fn missing_catalog_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "s");
        std::fs::write(layout.extent_path(ExtentKind::Catalog, 0), 0i32.to_le_bytes()).unwrap();
        let err = CatalogCache::build(layout).unwrap_err();
        assert!(matches!(err, ChronopipeError::CatalogCorrupt(_)));
    }
}

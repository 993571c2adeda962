//! The append-only extent file store: catalog, page index, and the
//! exporter/importer that write and read a multi-stream recording.
//!
//! A store named `name` rooted at a directory is a family of extent files
//! (catalog, page index, main data, large-message data) plus a live marker
//! file coordinating writer/reader handoff. See `extent` for the shared
//! block protocol, `index`/`catalog` for the two record kinds, and
//! `exporter`/`importer` for the multi-stream read/write surface.

pub mod catalog;
pub mod exporter;
pub mod extent;
pub mod importer;
pub mod index;
pub mod live_marker;

use std::path::{Path, PathBuf};

pub use catalog::{CatalogRecord, RuntimeInfo, StreamMetadata, TypeSchema};
pub use exporter::StoreExporter;
pub use importer::StoreImporter;
pub use index::IndexEntry;
pub use live_marker::LiveMarker;

/// Block payloads are padded to a multiple of this many bytes.
pub const BLOCK_ALIGN: usize = 4;

/// Rounds `len` up to the next multiple of [`BLOCK_ALIGN`].
#[must_use]
pub(crate) fn padded_len(len: usize) -> usize {
    (len + BLOCK_ALIGN - 1) / BLOCK_ALIGN * BLOCK_ALIGN
}

/// The four extent families a store is split into, per `SPEC_FULL.md`
/// section 6's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    /// `runtime_info`/`type_schema`/`stream_metadata` records.
    Catalog,
    /// Raw [`IndexEntry`] records, one per stored message.
    Index,
    /// Inline message payloads.
    Data,
    /// Payloads too large to inline (see [`exporter::LARGE_MESSAGE_THRESHOLD`]).
    LargeData,
}

impl ExtentKind {
    fn label(self) -> &'static str {
        match self {
            Self::Catalog => "Catalog",
            Self::Index => "Index",
            Self::Data => "Data",
            Self::LargeData => "LargeData",
        }
    }
}

/// Resolves the on-disk paths for one named store.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
    name: String,
}

impl StoreLayout {
    /// Creates a layout for store `name` rooted at `root`. `root` is the
    /// directory directly containing the store's files (the optional
    /// `name.NNNN` numbered subdirectory, when used, is `root` itself).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
        }
    }

    /// The store's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory containing this store's files.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the extent file for `kind` numbered `extent_id`.
    #[must_use]
    pub fn extent_path(&self, kind: ExtentKind, extent_id: u32) -> PathBuf {
        self.root.join(format!("{}.{}_{extent_id:06}.psi", self.name, kind.label()))
    }

    /// Path to the exclusive-hold live marker file.
    #[must_use]
    pub fn live_marker_path(&self) -> PathBuf {
        self.root.join(format!("{}.LivePsiStore", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_len_rounds_up_to_four() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 4);
        assert_eq!(padded_len(4), 4);
        assert_eq!(padded_len(5), 8);
    }

    #[test]
    fn layout_names_match_spec_pattern() {
        let layout = StoreLayout::new("/tmp/store", "demo");
        assert_eq!(layout.extent_path(ExtentKind::Catalog, 0), Path::new("/tmp/store/demo.Catalog_000000.psi"));
        assert_eq!(layout.extent_path(ExtentKind::Index, 3), Path::new("/tmp/store/demo.Index_000003.psi"));
        assert_eq!(layout.live_marker_path(), Path::new("/tmp/store/demo.LivePsiStore"));
    }
}

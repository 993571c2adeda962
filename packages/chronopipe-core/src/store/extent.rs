//! The append-only extent block protocol shared by every extent family.
//!
//! Each block is `[block_size: i32 LE][payload, padded to a 4-byte
//! multiple]`. A `0` size means "nothing committed past here yet" (the
//! writer has reserved the slot but not filled it — the signal a
//! live-follow reader polls on); a negative size means "this extent ends
//! here, continue reading at extent `-size`". Extents are otherwise
//! independently readable, which is what lets a rollover hand off cleanly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use memmap2::Mmap;

use crate::error::{ChronopipeError, ChronopipeResult};
use crate::store::{padded_len, ExtentKind, StoreLayout};

const SENTINEL_LEN: usize = 4;

/// Appends blocks to one extent family, rolling over to a new extent file
/// once the configured size threshold would be exceeded.
pub struct ExtentWriter {
    layout: StoreLayout,
    kind: ExtentKind,
    extent_id: u32,
    file: File,
    /// Offset of the not-yet-committed sentinel (also the append point).
    tail: u64,
    max_extent_bytes: u64,
}

impl ExtentWriter {
    /// Opens (creating if absent) extent 0 of `kind` for appending, rolling
    /// over to a new extent once a block would push the current one past
    /// `max_extent_bytes`.
    pub fn create(layout: StoreLayout, kind: ExtentKind, max_extent_bytes: u64) -> ChronopipeResult<Self> {
        let (file, tail) = Self::open_extent_file(&layout, kind, 0)?;
        Ok(Self {
            layout,
            kind,
            extent_id: 0,
            file,
            tail,
            max_extent_bytes,
        })
    }

    fn open_extent_file(layout: &StoreLayout, kind: ExtentKind, extent_id: u32) -> ChronopipeResult<(File, u64)> {
        let path = layout.extent_path(kind, extent_id);
        let mut file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        let len = file.seek(SeekFrom::End(0))?;
        if len == 0 {
            file.write_all(&0i32.to_le_bytes())?;
            file.flush()?;
        }
        let tail = Self::find_tail(&mut file)?;
        Ok((file, tail))
    }

    fn open_extent(&mut self, extent_id: u32) -> ChronopipeResult<()> {
        let (file, tail) = Self::open_extent_file(&self.layout, self.kind, extent_id)?;
        self.extent_id = extent_id;
        self.file = file;
        self.tail = tail;
        Ok(())
    }

    /// Scans forward from the start of a reopened extent to find the first
    /// uncommitted (`0`) sentinel, so a writer can resume an existing file.
    fn find_tail(file: &mut File) -> ChronopipeResult<u64> {
        file.seek(SeekFrom::Start(0))?;
        let mut cursor = 0u64;
        loop {
            let mut header = [0u8; 4];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(cursor),
                Err(e) => return Err(ChronopipeError::Io(e)),
            }
            let raw = i32::from_le_bytes(header);
            if raw <= 0 {
                return Ok(cursor);
            }
            let advance = padded_len(raw as usize) as u64;
            file.seek(SeekFrom::Current(advance as i64))?;
            cursor += SENTINEL_LEN as u64 + advance;
        }
    }

    /// Appends `payload` as one block, rolling over to a fresh extent first
    /// if it would not fit within `max_extent_bytes`. Returns the
    /// `(extent_id, position)` the block was actually written at, for
    /// callers that need to record a pointer to it (e.g. an index entry).
    pub fn append(&mut self, payload: &[u8]) -> ChronopipeResult<(u32, u64)> {
        let needed = SENTINEL_LEN as u64 + padded_len(payload.len()) as u64 + SENTINEL_LEN as u64;
        if self.tail + needed > self.max_extent_bytes && self.tail > 0 {
            self.roll_over()?;
        }

        let position = self.tail;
        self.file.seek(SeekFrom::Start(self.tail))?;
        self.file.write_all(&(payload.len() as i32).to_le_bytes())?;
        self.file.write_all(payload)?;
        let pad = padded_len(payload.len()) - payload.len();
        if pad > 0 {
            self.file.write_all(&vec![0u8; pad])?;
        }
        let new_tail = self.tail + SENTINEL_LEN as u64 + padded_len(payload.len()) as u64;
        self.file.write_all(&0i32.to_le_bytes())?;
        self.file.flush()?;
        self.tail = new_tail;
        Ok((self.extent_id, position))
    }

    fn roll_over(&mut self) -> ChronopipeResult<()> {
        let next_id = self.extent_id + 1;
        self.file.seek(SeekFrom::Start(self.tail))?;
        self.file.write_all(&(-(next_id as i32)).to_le_bytes())?;
        self.file.flush()?;
        self.open_extent(next_id)
    }

    /// The extent id currently being appended to.
    #[must_use]
    pub fn current_extent_id(&self) -> u32 {
        self.extent_id
    }

    /// The append offset within the current extent (where the next block's
    /// size header will be written).
    #[must_use]
    pub fn tail_position(&self) -> u64 {
        self.tail
    }
}

/// One block read from an extent family.
#[derive(Debug, Clone)]
pub struct ExtentBlock {
    /// Extent the block was read from (after following any rollover).
    pub extent_id: u32,
    /// Offset of the block's size header within that extent.
    pub position: u64,
    /// The block's payload, with padding already stripped.
    pub payload: Vec<u8>,
}

/// Outcome of attempting to read the next block.
pub enum ReadOutcome {
    /// A block was available.
    Block(ExtentBlock),
    /// The sentinel at the cursor is `0`: nothing committed yet. The
    /// extent may still be actively written to (live-follow).
    Pending,
}

/// Sequentially reads blocks from one extent family, following rollovers
/// transparently and supporting random-access reads by `(extent_id, position)`.
pub struct ExtentReader {
    layout: StoreLayout,
    kind: ExtentKind,
    extent_id: u32,
    mmap: Mmap,
    cursor: u64,
}

impl ExtentReader {
    /// Opens extent `extent_id` of `kind` for reading, starting the cursor
    /// at `position`.
    pub fn open(layout: StoreLayout, kind: ExtentKind, extent_id: u32, position: u64) -> ChronopipeResult<Self> {
        let mmap = Self::map_extent(&layout, kind, extent_id)?;
        Ok(Self {
            layout,
            kind,
            extent_id,
            mmap,
            cursor: position,
        })
    }

    fn map_extent(layout: &StoreLayout, kind: ExtentKind, extent_id: u32) -> ChronopipeResult<Mmap> {
        let path = layout.extent_path(kind, extent_id);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ChronopipeError::ExtentMissing(path.display().to_string())
            } else {
                ChronopipeError::Io(e)
            }
        })?;
        // SAFETY: extent files are append-only and never truncated while
        // mapped; readers observe only fully-written blocks because the
        // writer commits a block's sentinel only after its payload.
        unsafe { Mmap::map(&file).map_err(ChronopipeError::Io) }
    }

    /// Reads the next block, following a rollover sentinel into the next
    /// extent transparently.
    pub fn read_next(&mut self) -> ChronopipeResult<ReadOutcome> {
        loop {
            let pos = self.cursor as usize;
            if pos + SENTINEL_LEN > self.mmap.len() {
                return Ok(ReadOutcome::Pending);
            }
            let raw = i32::from_le_bytes(self.mmap[pos..pos + 4].try_into().unwrap());
            if raw == 0 {
                return Ok(ReadOutcome::Pending);
            }
            if raw < 0 {
                let next_extent = (-raw) as u32;
                self.mmap = Self::map_extent(&self.layout, self.kind, next_extent)?;
                self.extent_id = next_extent;
                self.cursor = 0;
                continue;
            }
            let size = raw as usize;
            let start = pos + SENTINEL_LEN;
            if start + size > self.mmap.len() {
                return Err(ChronopipeError::IndexCorrupt(format!(
                    "block at {pos} in extent {} claims {size} bytes past extent end",
                    self.extent_id
                )));
            }
            let payload = self.mmap[start..start + size].to_vec();
            let block = ExtentBlock {
                extent_id: self.extent_id,
                position: self.cursor,
                payload,
            };
            self.cursor = (start + padded_len(size)) as u64;
            return Ok(ReadOutcome::Block(block));
        }
    }

    /// Random-access read of the block at `(extent_id, position)`, without
    /// disturbing the sequential cursor.
    pub fn read_at(&self, extent_id: u32, position: u64) -> ChronopipeResult<Vec<u8>> {
        let mmap = Self::map_extent(&self.layout, self.kind, extent_id)?;
        let pos = position as usize;
        if pos + SENTINEL_LEN > mmap.len() {
            return Err(ChronopipeError::IndexCorrupt(format!(
                "read_at({extent_id}, {position}) points past the end of the extent"
            )));
        }
        let raw = i32::from_le_bytes(mmap[pos..pos + 4].try_into().unwrap());
        if raw <= 0 {
            return Err(ChronopipeError::IndexCorrupt(format!(
                "read_at({extent_id}, {position}) does not point at a committed block"
            )));
        }
        let size = raw as usize;
        let start = pos + SENTINEL_LEN;
        if start + size > mmap.len() {
            return Err(ChronopipeError::IndexCorrupt(format!(
                "block at {position} in extent {extent_id} claims {size} bytes past extent end"
            )));
        }
        Ok(mmap[start..start + size].to_vec())
    }

    /// Jumps the sequential cursor to `(extent_id, position)`, remapping if
    /// it differs from the currently mapped extent.
    pub fn seek_to(&mut self, extent_id: u32, position: u64) -> ChronopipeResult<()> {
        if extent_id != self.extent_id {
            self.mmap = Self::map_extent(&self.layout, self.kind, extent_id)?;
            self.extent_id = extent_id;
        }
        self.cursor = position;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_then_reader_round_trips_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "s");
        let mut writer = ExtentWriter::create(layout.clone(), ExtentKind::Data, 1 << 20).unwrap();
        writer.append(b"hello").unwrap();
        writer.append(b"world!!").unwrap();

        let mut reader = ExtentReader::open(layout, ExtentKind::Data, 0, 0).unwrap();
        let first = match reader.read_next().unwrap() {
            ReadOutcome::Block(b) => b,
            ReadOutcome::Pending => panic!("expected a block"),
        };
        assert_eq!(first.payload, b"hello");
        let second = match reader.read_next().unwrap() {
            ReadOutcome::Block(b) => b,
            ReadOutcome::Pending => panic!("expected a block"),
        };
        assert_eq!(second.payload, b"world!!");
        assert!(matches!(reader.read_next().unwrap(), ReadOutcome::Pending));
    }

    #[test]
    fn small_max_extent_bytes_forces_rollover() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "s");
        let mut writer = ExtentWriter::create(layout.clone(), ExtentKind::Data, 24).unwrap();
        writer.append(b"0123456789AB").unwrap();
        writer.append(b"rolled-over-payload").unwrap();
        assert!(writer.current_extent_id() >= 1);

        let mut reader = ExtentReader::open(layout, ExtentKind::Data, 0, 0).unwrap();
        let first = match reader.read_next().unwrap() {
            ReadOutcome::Block(b) => b,
            ReadOutcome::Pending => panic!("expected a block"),
        };
        assert_eq!(first.payload, b"0123456789AB");
        let second = match reader.read_next().unwrap() {
            ReadOutcome::Block(b) => b,
            ReadOutcome::Pending => panic!("expected the rolled-over block"),
        };
        assert_eq!(second.payload, b"rolled-over-payload");
    }

    #[test]
    fn read_at_is_independent_of_the_sequential_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "s");
        let mut writer = ExtentWriter::create(layout.clone(), ExtentKind::Data, 1 << 20).unwrap();
        writer.append(b"first").unwrap();
        let second_pos = writer.tail_position();
        writer.append(b"second").unwrap();

        let reader = ExtentReader::open(layout, ExtentKind::Data, 0, 0).unwrap();
        assert_eq!(reader.read_at(0, second_pos).unwrap(), b"second");
    }

    #[test]
    fn read_at_rejects_a_header_past_the_extent_end_instead_of_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "s");
        let mut writer = ExtentWriter::create(layout.clone(), ExtentKind::Data, 1 << 20).unwrap();
        writer.append(b"only-block").unwrap();

        let reader = ExtentReader::open(layout, ExtentKind::Data, 0, 0).unwrap();
        let err = reader.read_at(0, 10_000).unwrap_err();
        assert!(matches!(err, ChronopipeError::IndexCorrupt(_)));
    }

    #[test]
    fn read_at_rejects_a_size_claiming_bytes_past_the_extent_end() {
        use std::fs::OpenOptions;
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "s");
        let mut writer = ExtentWriter::create(layout.clone(), ExtentKind::Data, 1 << 20).unwrap();
        writer.append(b"short").unwrap();
        drop(writer);

        // Corrupt the on-disk header to claim a size far larger than the
        // file actually holds, simulating a stale or corrupted index entry.
        let path = layout.extent_path(ExtentKind::Data, 0);
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&1_000_000i32.to_le_bytes()).unwrap();
        file.flush().unwrap();
        drop(file);

        let reader = ExtentReader::open(layout, ExtentKind::Data, 0, 0).unwrap();
        let err = reader.read_at(0, 0).unwrap_err();
        assert!(matches!(err, ChronopipeError::IndexCorrupt(_)));
    }
}

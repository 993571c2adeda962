//! The live marker file: an exclusive-hold file a writer keeps open for its
//! entire lifetime, letting readers distinguish "writer still running" from
//! "store finished and closed" without any other coordination channel.

use std::fs::{File, OpenOptions};

use fs2::FileExt;

use crate::error::ChronopipeResult;
use crate::store::StoreLayout;

/// Held by a store writer for as long as it runs. Dropping it releases the
/// lock and (best-effort) removes the marker file.
pub struct LiveMarker {
    file: File,
    path: std::path::PathBuf,
}

impl LiveMarker {
    /// Creates and exclusively locks the marker file for `layout`. Fails if
    /// another writer already holds it.
    pub fn acquire(layout: &StoreLayout) -> ChronopipeResult<Self> {
        let path = layout.live_marker_path();
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.try_lock_exclusive()?;
        Ok(Self { file, path })
    }

    /// True if `layout`'s marker file exists and is currently held
    /// exclusively by a writer: presence alone is not proof of liveness,
    /// only failing to acquire the lock is.
    #[must_use]
    pub fn is_live(layout: &StoreLayout) -> bool {
        let path = layout.live_marker_path();
        let Ok(file) = OpenOptions::new().write(true).open(&path) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }
}

impl Drop for LiveMarker {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_reports_live_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "s");
        assert!(!LiveMarker::is_live(&layout));
        let marker = LiveMarker::acquire(&layout).unwrap();
        assert!(LiveMarker::is_live(&layout));
        drop(marker);
        assert!(!LiveMarker::is_live(&layout));
    }

    #[test]
    fn second_acquire_fails_while_first_holds_it() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path(), "s");
        let _first = LiveMarker::acquire(&layout).unwrap();
        let err = LiveMarker::acquire(&layout);
        assert!(err.is_err());
    }
}

//! Recursive byte totals for a directory tree that another process is
//! actively writing to.
//!
//! Parallel data pipelines create and delete temporary files while a scan
//! is in flight, so an entry that disappears between being listed and being
//! stat'ed is counted as zero instead of failing the whole walk.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::Path;

use tracing::trace;
use walkdir::WalkDir;

/// Sum of the sizes, in bytes, of all regular files under `root`.
///
/// A missing `root` yields `Ok(0)`: the job may not have created its output
/// directory yet. Symlinks are not followed. Any error other than
/// `NotFound` is returned to the caller.
pub fn dir_size(root: &Path) -> io::Result<u64> {
    let mut total = 0u64;

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if is_not_found(&e) {
                    trace!(path = ?e.path(), "entry vanished during scan");
                    continue;
                }
                return Err(e.into());
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        total = total.saturating_add(listed_file_size(entry.path())?);
    }

    Ok(total)
}

/// Size of a file that was seen in a directory listing.
///
/// Returns `Ok(0)` when the file has been removed since it was listed.
pub fn listed_file_size(path: &Path) -> io::Result<u64> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        Ok(_) => Ok(0),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            trace!(path = %path.display(), "file vanished before stat");
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .is_some_and(|io| io.kind() == ErrorKind::NotFound)
}

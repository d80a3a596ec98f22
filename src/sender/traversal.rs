//! Initial walk of the source directory's immediate children.
//!
//! Grounded on `client/copy.c`'s `_traversal`/`client_copy_files`: only the root's immediate
//! children are processed; a directory found among them would require recursing to a second
//! level, which the original refuses by stopping the whole walk rather than skipping just that
//! subtree (see Open Question (b) in `SPEC_FULL.md` §9, resolved in `DESIGN.md`).

use crate::error::{Error, ProtocolError, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

/// One regular file discovered directly under the source root.
#[derive(Clone, Debug)]
pub struct Entry {
    /// Path relative to the source root, used as the wire-protocol path.
    pub rel_path: String,
    /// Absolute path on the local filesystem.
    pub abs_path: PathBuf,
}

/// List the regular files directly under `source`.
///
/// Unreadable or non-regular entries (sockets, fifos, symlinks) are logged and skipped.
/// A nested directory aborts the whole walk with [`ProtocolError::UnsupportedDepth`].
pub async fn walk(source: &Path) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut rd = match tokio::fs::read_dir(source).await {
        Ok(rd) => rd,
        Err(e) => return Err(Error::Io(e)),
    };

    while let Some(dir_entry) = rd.next_entry().await? {
        let path = dir_entry.path();
        let file_type = match dir_entry.file_type().await {
            Ok(ft) => ft,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if file_type.is_dir() {
            return Err(Error::Protocol(ProtocolError::UnsupportedDepth));
        }
        if !file_type.is_file() {
            warn!(path = %path.display(), "skipping non-regular entry");
            continue;
        }

        let rel_path = dir_entry.file_name().to_string_lossy().into_owned();
        entries.push(Entry {
            rel_path,
            abs_path: path,
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_regular_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"1").unwrap();
        std::fs::write(dir.path().join("b"), b"2").unwrap();

        let mut entries = walk(dir.path()).await.unwrap();
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].rel_path, "a");
        assert_eq!(entries[1].rel_path, "b");
    }

    #[tokio::test]
    async fn nested_directory_aborts_walk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let err = walk(dir.path()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnsupportedDepth)
        ));
    }
}

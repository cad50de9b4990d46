//! Save-file collection.
//!
//! Walks the save directory and opens every regular file under it. The
//! directory structure is flattened: each file is known by its base name only.

use crate::utils::errors::{BackupError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// A save file opened for reading.
///
/// The handle is closed when the value is dropped, so whoever holds the
/// collection owns the file descriptors.
#[derive(Debug)]
pub struct CollectedFile {
    /// Base name, used as attachment and archive entry name
    pub name: String,

    /// MIME type hint derived from the extension
    pub content_type: &'static str,

    /// Full path on disk
    pub path: PathBuf,

    /// Size in bytes at open time
    pub size: u64,

    /// Open handle positioned at the start of the file
    pub file: File,
}

impl CollectedFile {
    /// Open `path` and describe it.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| BackupError::collection(path, e))?;
        let size = file
            .metadata()
            .map_err(|e| BackupError::collection(path, e))?
            .len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            content_type: content_type_for(&name),
            name,
            path: path.to_path_buf(),
            size,
            file,
        })
    }
}

/// Collect every regular file below `root`, in traversal order.
///
/// The root itself is never returned and symlinks are not followed. Any
/// error aborts the whole collection; handles opened so far are closed
/// when the partial list is dropped.
///
/// # Example
/// ```no_run
/// use world_backup::fs::collector::collect_files;
/// use std::path::Path;
///
/// let files = collect_files(Path::new("/srv/valheim/worlds")).unwrap();
/// println!("Found {} save files", files.len());
/// ```
pub fn collect_files(root: &Path) -> Result<Vec<CollectedFile>> {
    let metadata = std::fs::metadata(root).map_err(|e| BackupError::collection(root, e))?;
    if !metadata.is_dir() {
        return Err(BackupError::collection(
            root,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
        ));
    }

    let mut files = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry?;

        if !entry.file_type().is_file() {
            continue;
        }

        let collected = CollectedFile::open(entry.path())?;
        debug!("Collected {} ({} bytes)", collected.path.display(), collected.size);
        files.push(collected);
    }

    Ok(files)
}

/// Guess a MIME type from a file name.
pub fn content_type_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());

    match extension.as_deref() {
        Some("zip") => "application/zip",
        Some("json") => "application/json",
        Some("txt") | Some("log") => "text/plain",
        _ => "application/octet-stream",
    }
}

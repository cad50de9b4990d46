//! Zip packaging of collected save files.
//!
//! Entries are streamed straight from the open handles into the archive, so
//! memory use does not grow with the size of the save directory.

use crate::fs::collector::CollectedFile;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, TimeZone};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Content type of the produced artifact.
pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// A zip written for one tick. Left on disk after delivery.
#[derive(Debug, Clone)]
pub struct ArchiveArtifact {
    pub path: PathBuf,

    /// Number of entries written
    pub entries: usize,

    /// Names that appeared more than once; only the last file was kept
    pub superseded: Vec<String>,
}

impl ArchiveArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// `<game>-backup-<YYYY-MM-DD_HH-MM-SS>.zip`
pub fn artifact_file_name<Tz: TimeZone>(game: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}-backup-{}.zip",
        game_slug(game),
        at.format("%Y-%m-%d_%H-%M-%S")
    )
}

fn game_slug(game: &str) -> String {
    let slug: String = game
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "game".to_string()
    } else {
        slug.to_string()
    }
}

/// Drop every file whose name reappears later in the list.
///
/// Returns the surviving files in their original order and the names that
/// collided. Superseded handles are closed here without being read.
fn last_wins(files: Vec<CollectedFile>) -> (Vec<CollectedFile>, Vec<String>) {
    let mut last_index: HashMap<String, usize> = HashMap::with_capacity(files.len());
    for (idx, file) in files.iter().enumerate() {
        last_index.insert(file.name.clone(), idx);
    }

    let mut kept = Vec::with_capacity(last_index.len());
    let mut superseded = Vec::new();

    for (idx, file) in files.into_iter().enumerate() {
        if last_index.get(&file.name) == Some(&idx) {
            kept.push(file);
        } else {
            warn!(
                "Duplicate save file name {}: {} is replaced by a later file",
                file.name,
                file.path.display()
            );
            if !superseded.contains(&file.name) {
                superseded.push(file.name.clone());
            }
        }
    }

    (kept, superseded)
}

/// Write `files` into a new zip at `dest`.
///
/// On failure the partially written file stays on disk and must not be
/// trusted.
pub fn build_archive(dest: &Path, files: Vec<CollectedFile>) -> Result<ArchiveArtifact> {
    let (files, superseded) = last_wins(files);

    let output = File::create(dest).map_err(|e| BackupError::build(dest, e))?;
    let mut zip = ZipWriter::new(BufWriter::new(output));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let entries = files.len();
    for mut file in files {
        let entry_options = options.large_file(file.size >= u32::MAX as u64);

        zip.start_file(file.name.clone(), entry_options)
            .map_err(|e| BackupError::build(dest, format!("{}: {}", file.name, e)))?;
        std::io::copy(&mut file.file, &mut zip).map_err(|e| {
            BackupError::build(dest, format!("failed to write {}: {}", file.name, e))
        })?;
    }

    let writer = zip.finish().map_err(|e| BackupError::build(dest, e))?;
    writer
        .into_inner()
        .map_err(|e| BackupError::build(dest, e.error()))?;

    info!("Wrote {} ({} entries)", dest.display(), entries);

    Ok(ArchiveArtifact {
        path: dest.to_path_buf(),
        entries,
        superseded,
    })
}

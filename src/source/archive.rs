//! Speaker-track archive extraction.
//!
//! Entries are named `{track_index}-{display_name}.{ext}`. Any entry whose
//! resolved destination would escape the target directory poisons the whole
//! archive: nothing is written. Entries not matching the naming pattern are
//! skipped.

use regex::Regex;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::errors::{PipelineError, Result};

/// `{track}-{name}.{ext}` with a known audio extension.
fn entry_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)-(.+)\.(aac|flac|ogg|opus|mp3|m4a|wav)$")
            .expect("entry pattern regex is valid")
    })
}

/// One extracted per-speaker audio file.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntry {
    pub track_index: u32,
    pub display_name: String,
    pub file_path: PathBuf,
}

/// True when an entry name would resolve outside the extraction directory.
fn escapes_destination(name: &str) -> bool {
    if name.starts_with('/') || name.starts_with('\\') {
        return true;
    }
    // Windows drive prefix ("C:...") in a hostile archive.
    if name.len() >= 2 && name.as_bytes()[1] == b':' {
        return true;
    }
    name.split(['/', '\\']).any(|component| component == "..")
}

/// Peek at the archive and return `(track_index, display_name)` pairs for
/// the valid entries, without writing anything.
pub fn peek_entries(archive_bytes: &[u8]) -> Result<Vec<(u32, String)>> {
    let archive = ZipArchive::new(Cursor::new(archive_bytes))
        .map_err(|e| PipelineError::Acquisition(format!("invalid archive: {e}")))?;

    reject_escaping_entries(&archive)?;

    let mut entries = Vec::new();
    for name in archive.file_names() {
        if let Some(caps) = entry_pattern().captures(name) {
            let track: u32 = caps[1]
                .parse()
                .map_err(|e| PipelineError::Acquisition(format!("bad track number in {name}: {e}")))?;
            entries.push((track, caps[2].to_string()));
        }
    }
    Ok(entries)
}

/// Extract every valid speaker-track entry into `dest_dir`.
///
/// Fails without writing a single file if any entry name escapes `dest_dir`;
/// fails if no valid entry exists.
pub fn extract_speaker_archive(
    archive_bytes: &[u8],
    dest_dir: &Path,
) -> Result<Vec<ExtractedEntry>> {
    let mut archive = ZipArchive::new(Cursor::new(archive_bytes))
        .map_err(|e| PipelineError::Acquisition(format!("invalid archive: {e}")))?;

    // Validate every entry name before the first write.
    reject_escaping_entries(&archive)?;

    let mut results: Vec<ExtractedEntry> = Vec::new();

    for index in 0..archive.len() {
        let mut file = archive
            .by_index(index)
            .map_err(|e| PipelineError::Acquisition(format!("unreadable archive entry: {e}")))?;
        let name = file.name().to_string();

        let Some(caps) = entry_pattern().captures(&name) else {
            debug!("Skipping non-track archive entry: {name}");
            continue;
        };
        let track_index: u32 = caps[1]
            .parse()
            .map_err(|e| PipelineError::Acquisition(format!("bad track number in {name}: {e}")))?;
        let display_name = caps[2].to_string();

        let relative = file.enclosed_name().ok_or_else(|| {
            PipelineError::Acquisition(format!("archive entry escapes destination: {name}"))
        })?;
        let dest_file = dest_dir.join(relative);

        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)
            .map_err(|e| PipelineError::Acquisition(format!("failed to read entry {name}: {e}")))?;
        std::fs::write(&dest_file, &contents).map_err(|e| {
            PipelineError::Acquisition(format!(
                "failed to write {}: {e}",
                dest_file.display()
            ))
        })?;

        debug!("Extracted {name} -> {}", dest_file.display());
        results.push(ExtractedEntry {
            track_index,
            display_name,
            file_path: dest_file,
        });
    }

    if results.is_empty() {
        return Err(PipelineError::Acquisition(
            "archive contains no speaker-track entries".to_string(),
        ));
    }

    Ok(results)
}

fn reject_escaping_entries<R: std::io::Read + std::io::Seek>(
    archive: &ZipArchive<R>,
) -> Result<()> {
    for name in archive.file_names() {
        if escapes_destination(name) {
            warn!("Blocked path-traversal attempt in archive entry: {name}");
            return Err(PipelineError::Acquisition(format!(
                "archive entry escapes destination: {name}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut writer = ZipWriter::new(Cursor::new(&mut buffer));
            let options = SimpleFileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer
    }

    #[test]
    fn extracts_matching_entries_and_skips_others() {
        let bytes = build_archive(&[
            ("1-alice.aac", b"aaa"),
            ("2-bob.aac", b"bbb"),
            ("info.txt", b"metadata"),
        ]);
        let dir = tempfile::tempdir().unwrap();

        let entries = extract_speaker_archive(&bytes, dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].track_index, 1);
        assert_eq!(entries[0].display_name, "alice");
        assert!(entries[0].file_path.starts_with(dir.path()));
        assert!(entries[0].file_path.exists());
        assert!(!dir.path().join("info.txt").exists());
    }

    #[test]
    fn escaping_entry_rejects_archive_without_writing() {
        let bytes = build_archive(&[
            ("1-alice.m4a", b"aaa"),
            ("../evil.sh", b"#!/bin/sh"),
        ]);
        let dir = tempfile::tempdir().unwrap();

        let err = extract_speaker_archive(&bytes, dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::Acquisition(_)));
        // Nothing written, not even the legitimate entry.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn absolute_entry_rejects_archive() {
        let bytes = build_archive(&[("/etc/1-alice.aac", b"aaa")]);
        let dir = tempfile::tempdir().unwrap();
        assert!(extract_speaker_archive(&bytes, dir.path()).is_err());
    }

    #[test]
    fn zero_valid_entries_is_an_error() {
        let bytes = build_archive(&[("readme.md", b"hello")]);
        let dir = tempfile::tempdir().unwrap();
        let err = extract_speaker_archive(&bytes, dir.path()).unwrap_err();
        assert!(err.to_string().contains("no speaker-track entries"));
    }

    #[test]
    fn garbage_bytes_are_an_acquisition_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_speaker_archive(b"not a zip", dir.path()).unwrap_err();
        assert!(matches!(err, PipelineError::Acquisition(_)));
    }

    #[test]
    fn peek_lists_tracks_without_writing() {
        let bytes = build_archive(&[("1-alice.aac", b"a"), ("3-carol.flac", b"c")]);
        let entries = peek_entries(&bytes).unwrap();
        assert_eq!(entries, vec![(1, "alice".to_string()), (3, "carol".to_string())]);
    }

    #[test]
    fn escapes_destination_cases() {
        assert!(escapes_destination("../evil.sh"));
        assert!(escapes_destination("a/../../evil.sh"));
        assert!(escapes_destination("/abs/path.aac"));
        assert!(escapes_destination("C:\\windows\\evil.aac"));
        assert!(!escapes_destination("1-alice.aac"));
        assert!(!escapes_destination("nested/2-bob.aac"));
    }
}

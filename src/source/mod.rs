//! Audio acquisition: the two-operation source contract and shared types.
//!
//! A source produces speaker-tagged audio files inside a directory owned by
//! the pipeline invocation. Concrete sources: the Cook API client (panel
//! triggers) and the Drive archive source (folder triggers).

pub mod archive;
pub mod cook;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::{PipelineError, Result};

/// One speaker's identity within a recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerInfo {
    /// 1-based track number, unique within a recording.
    pub track_index: u32,
    pub display_name: String,
    pub user_id: u64,
}

/// A speaker's extracted audio file. The file lives under the pipeline's
/// temp root and is valid until that root is released.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub speaker: SpeakerInfo,
    pub file_path: PathBuf,
}

/// Abstract acquisition contract consumed by the pipeline.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Authoritative speaker metadata for the recording.
    async fn list_speakers(&self) -> Result<Vec<SpeakerInfo>>;

    /// Download and extract the per-speaker archive into `into`.
    ///
    /// Every returned path exists, lies under `into`, and corresponds to
    /// exactly one speaker from `list_speakers()`.
    async fn fetch(&self, into: &Path) -> Result<Vec<AudioTrack>>;
}

/// Pair extracted archive entries with the authoritative speaker list.
///
/// Unknown or duplicate track indexes are mapping errors; speakers without
/// a file (never unmuted) are logged and skipped. The result is sorted by
/// ascending track index.
pub fn map_tracks(
    entries: Vec<archive::ExtractedEntry>,
    speakers: &[SpeakerInfo],
) -> Result<Vec<AudioTrack>> {
    let mut tracks: Vec<AudioTrack> = Vec::with_capacity(entries.len());

    for entry in entries {
        let speaker = speakers
            .iter()
            .find(|s| s.track_index == entry.track_index)
            .ok_or_else(|| {
                PipelineError::Acquisition(format!(
                    "archive entry for track {} has no matching speaker",
                    entry.track_index
                ))
            })?;

        if tracks.iter().any(|t| t.speaker.track_index == entry.track_index) {
            return Err(PipelineError::Acquisition(format!(
                "archive contains more than one file for track {}",
                entry.track_index
            )));
        }

        tracks.push(AudioTrack {
            speaker: speaker.clone(),
            file_path: entry.file_path,
        });
    }

    for speaker in speakers {
        if !tracks.iter().any(|t| t.speaker.track_index == speaker.track_index) {
            warn!(
                "No audio file for speaker {} (track {})",
                speaker.display_name, speaker.track_index
            );
        }
    }

    tracks.sort_by_key(|t| t.speaker.track_index);
    Ok(tracks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speaker(track: u32, name: &str) -> SpeakerInfo {
        SpeakerInfo {
            track_index: track,
            display_name: name.to_string(),
            user_id: 0,
        }
    }

    fn entry(track: u32, name: &str) -> archive::ExtractedEntry {
        archive::ExtractedEntry {
            track_index: track,
            display_name: name.to_string(),
            file_path: PathBuf::from(format!("/tmp/{track}-{name}.aac")),
        }
    }

    #[test]
    fn maps_and_sorts_by_track() {
        let speakers = vec![speaker(2, "bob"), speaker(1, "alice")];
        let tracks =
            map_tracks(vec![entry(2, "bob"), entry(1, "alice")], &speakers).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].speaker.track_index, 1);
        assert_eq!(tracks[1].speaker.track_index, 2);
    }

    #[test]
    fn unknown_track_is_mapping_error() {
        let speakers = vec![speaker(1, "alice")];
        let err = map_tracks(vec![entry(3, "ghost")], &speakers).unwrap_err();
        assert!(matches!(err, PipelineError::Acquisition(_)));
    }

    #[test]
    fn duplicate_track_is_mapping_error() {
        let speakers = vec![speaker(1, "alice")];
        let err =
            map_tracks(vec![entry(1, "alice"), entry(1, "alice")], &speakers).unwrap_err();
        assert!(matches!(err, PipelineError::Acquisition(_)));
    }

    #[test]
    fn missing_file_for_speaker_is_tolerated() {
        let speakers = vec![speaker(1, "alice"), speaker(2, "bob")];
        let tracks = map_tracks(vec![entry(1, "alice")], &speakers).unwrap();
        assert_eq!(tracks.len(), 1);
    }
}

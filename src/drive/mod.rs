//! Drive folder watcher: polls for new recording archives and hands each
//! one to the injected pipeline sink exactly once.
//!
//! The watcher runs on a single worker; a tick-in-progress flag keeps the
//! periodic loop and the manual poll endpoint from overlapping. A file id
//! is recorded into the persisted processed set only after its pipeline run
//! reaches a terminal outcome, so a crash mid-run retries on restart.

pub mod client;
pub mod processed;

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::config::DriveConfig;
use crate::detector::{RecordingHandle, TriggerKind};
use crate::errors::Result;
use crate::source::{archive, map_tracks, AudioSource, AudioTrack, SpeakerInfo};
use client::{DriveFile, DriveFolder};
use processed::ProcessedSet;

/// Receives detected recordings; injected at construction so the watcher
/// never imports the pipeline.
#[async_trait]
pub trait RecordingSink: Send + Sync {
    async fn on_recording(&self, handle: RecordingHandle);
}

/// Simple wildcard match supporting `*` and `?`.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut backtrack = 0usize;

    while ni < name.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == name[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star = Some(pi);
            backtrack = ni;
            pi += 1;
        } else if let Some(star_at) = star {
            pi = star_at + 1;
            backtrack += 1;
            ni = backtrack;
        } else {
            return false;
        }
    }

    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// Derive a pseudo recording id from an archive filename, so drive-sourced
/// runs share the active-set and status-line machinery.
pub fn pseudo_recording_id(file_name: &str, file_id: &str) -> String {
    let stem: String = file_name
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if stem.is_empty() {
        format!("drive-{}", file_id.chars().take(8).collect::<String>())
    } else {
        stem
    }
}

/// Audio source backed by an archive file in the watched folder. Speaker
/// metadata comes from the archive entry names; there is no separate
/// authoritative listing for drive-sourced recordings.
pub struct DriveArchiveSource {
    client: Arc<dyn DriveFolder>,
    file_id: String,
    bytes: Mutex<Option<Vec<u8>>>,
}

impl DriveArchiveSource {
    pub fn new(client: Arc<dyn DriveFolder>, file_id: String) -> Self {
        Self {
            client,
            file_id,
            bytes: Mutex::new(None),
        }
    }

    async fn archive_bytes(&self) -> Result<Vec<u8>> {
        let mut cached = self.bytes.lock().await;
        if let Some(bytes) = cached.as_ref() {
            return Ok(bytes.clone());
        }
        let bytes = self
            .client
            .download(&self.file_id)
            .await
            .map_err(|e| crate::errors::PipelineError::Acquisition(e.to_string()))?;
        *cached = Some(bytes.clone());
        Ok(bytes)
    }

    fn speakers_from_entries(entries: &[(u32, String)]) -> Vec<SpeakerInfo> {
        entries
            .iter()
            .map(|(track, name)| SpeakerInfo {
                track_index: *track,
                display_name: name.clone(),
                user_id: 0,
            })
            .collect()
    }
}

#[async_trait]
impl AudioSource for DriveArchiveSource {
    async fn list_speakers(&self) -> Result<Vec<SpeakerInfo>> {
        let bytes = self.archive_bytes().await?;
        let entries = archive::peek_entries(&bytes)?;
        if entries.is_empty() {
            return Err(crate::errors::PipelineError::Acquisition(
                "archive contains no speaker-track entries".to_string(),
            ));
        }
        Ok(Self::speakers_from_entries(&entries))
    }

    async fn fetch(&self, into: &Path) -> Result<Vec<AudioTrack>> {
        let bytes = self.archive_bytes().await?;
        let speakers = {
            let entries = archive::peek_entries(&bytes)?;
            Self::speakers_from_entries(&entries)
        };
        let extracted = archive::extract_speaker_archive(&bytes, into)?;
        map_tracks(extracted, &speakers)
    }
}

pub struct DriveWatcher {
    cfg: DriveConfig,
    client: Arc<dyn DriveFolder>,
    sink: Arc<dyn RecordingSink>,
    processed: Mutex<ProcessedSet>,
    tick_in_progress: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl DriveWatcher {
    pub fn new(
        cfg: DriveConfig,
        client: Arc<dyn DriveFolder>,
        sink: Arc<dyn RecordingSink>,
        processed: ProcessedSet,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            client,
            sink,
            processed: Mutex::new(processed),
            tick_in_progress: AtomicBool::new(false),
            shutdown,
        }
    }

    pub async fn processed_count(&self) -> usize {
        self.processed.lock().await.len()
    }

    /// Poll loop. Stops cooperatively between ticks when the shutdown
    /// signal fires.
    pub async fn run(&self) {
        info!(
            "Drive watcher starting (folder={}, interval={}s, pattern={})",
            self.cfg.folder_id, self.cfg.poll_interval_sec, self.cfg.file_pattern
        );

        let mut shutdown = self.shutdown.clone();
        let interval = Duration::from_secs(self.cfg.poll_interval_sec);

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(err) = self.poll_once().await {
                error!("Drive poll failed: {err}");
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Drive watcher stopped");
    }

    /// Run one tick. Shared with the manual poll endpoint; overlapping
    /// invocations are skipped via the tick flag.
    pub async fn poll_once(&self) -> Result<()> {
        if self.tick_in_progress.swap(true, Ordering::SeqCst) {
            info!("Drive poll already in progress; skipping");
            return Ok(());
        }
        let outcome = self.tick().await;
        self.tick_in_progress.store(false, Ordering::SeqCst);
        outcome
    }

    async fn tick(&self) -> Result<()> {
        let files = self.client.list_files().await?;

        let new_files: Vec<DriveFile> = {
            let processed = self.processed.lock().await;
            files
                .into_iter()
                .filter(|file| glob_match(&self.cfg.file_pattern, &file.name))
                .filter(|file| !processed.contains(&file.id))
                .collect()
        };

        if !new_files.is_empty() {
            info!(
                "Found {} new drive file(s): {:?}",
                new_files.len(),
                new_files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>()
            );
        }

        for file in new_files {
            if *self.shutdown.borrow() {
                info!("Shutdown requested; leaving remaining drive files for restart");
                break;
            }
            self.process_file(&file).await;
        }

        Ok(())
    }

    /// Hand one file to the pipeline sink, then record the terminal outcome.
    async fn process_file(&self, file: &DriveFile) {
        info!("Processing drive file {} ({})", file.name, file.id);

        let handle = RecordingHandle {
            recording_id: pseudo_recording_id(&file.name, &file.id),
            access_key: String::new(),
            origin_channel_id: 0,
            trigger: TriggerKind::DriveFile,
            drive_file_id: Some(file.id.clone()),
            source_domain: String::new(),
        };

        // The sink owns the error boundary; by the time it returns the
        // outcome is terminal either way.
        self.sink.on_recording(handle).await;

        let mut processed = self.processed.lock().await;
        if let Err(err) = processed.mark(&file.id) {
            warn!(
                "Failed to persist processed mark for {} ({}): {err}",
                file.name, file.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn glob_match_patterns() {
        assert!(glob_match("craig_*.aac.zip", "craig_20260801.aac.zip"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("??.zip", "ab.zip"));
        assert!(!glob_match("craig_*.aac.zip", "craig_20260801.flac.zip"));
        assert!(!glob_match("??.zip", "abc.zip"));
        assert!(glob_match("a*b*c", "a-x-b-y-c"));
        assert!(!glob_match("a*b*c", "a-x-b-y"));
    }

    #[test]
    fn pseudo_id_sanitizes_stem() {
        assert_eq!(
            pseudo_recording_id("craig_2026 08.aac.zip", "f1"),
            "craig_2026-08"
        );
        assert_eq!(pseudo_recording_id(".hidden", "abcdefghij"), "drive-abcdefgh");
    }

    struct StaticFolder {
        files: Vec<DriveFile>,
        archive: Vec<u8>,
    }

    #[async_trait]
    impl DriveFolder for StaticFolder {
        async fn list_files(&self) -> Result<Vec<DriveFile>> {
            Ok(self.files.clone())
        }
        async fn download(&self, _file_id: &str) -> Result<Vec<u8>> {
            Ok(self.archive.clone())
        }
    }

    struct CollectingSink {
        handles: StdMutex<Vec<RecordingHandle>>,
    }

    #[async_trait]
    impl RecordingSink for CollectingSink {
        async fn on_recording(&self, handle: RecordingHandle) {
            self.handles.lock().unwrap().push(handle);
        }
    }

    fn speaker_archive() -> Vec<u8> {
        use std::io::{Cursor, Write};
        use zip::write::SimpleFileOptions;
        let mut buffer = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buffer));
            writer
                .start_file("1-alice.aac", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"audio").unwrap();
            writer.finish().unwrap();
        }
        buffer
    }

    fn watcher_with(
        files: Vec<DriveFile>,
        processed_path: &Path,
    ) -> (Arc<DriveWatcher>, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink {
            handles: StdMutex::new(Vec::new()),
        });
        let (_tx, rx) = watch::channel(false);
        let mut cfg = DriveConfig::default();
        cfg.enabled = true;
        cfg.folder_id = "folder".to_string();
        let watcher = DriveWatcher::new(
            cfg,
            Arc::new(StaticFolder {
                files,
                archive: speaker_archive(),
            }),
            sink.clone(),
            ProcessedSet::load(processed_path).unwrap(),
            rx,
        );
        (Arc::new(watcher), sink)
    }

    #[tokio::test]
    async fn tick_emits_handles_and_marks_processed() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("processed.json");
        let files = vec![
            DriveFile {
                id: "f1".into(),
                name: "craig_a.aac.zip".into(),
            },
            DriveFile {
                id: "f2".into(),
                name: "notes.txt".into(),
            },
        ];
        let (watcher, sink) = watcher_with(files, &db);

        watcher.poll_once().await.unwrap();

        let handles = sink.handles.lock().unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].trigger, TriggerKind::DriveFile);
        assert_eq!(handles[0].drive_file_id.as_deref(), Some("f1"));
        assert_eq!(handles[0].recording_id, "craig_a");
        drop(handles);

        // Persisted before the next tick can begin.
        let reloaded = ProcessedSet::load(&db).unwrap();
        assert!(reloaded.contains("f1"));
        assert!(!reloaded.contains("f2"));
    }

    #[tokio::test]
    async fn second_tick_skips_processed_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("processed.json");
        let files = vec![DriveFile {
            id: "f1".into(),
            name: "craig_a.aac.zip".into(),
        }];
        let (watcher, sink) = watcher_with(files, &db);

        watcher.poll_once().await.unwrap();
        watcher.poll_once().await.unwrap();

        assert_eq!(sink.handles.lock().unwrap().len(), 1);
        assert_eq!(watcher.processed_count().await, 1);
    }

    #[tokio::test]
    async fn drive_source_lists_speakers_from_entries() {
        let folder = Arc::new(StaticFolder {
            files: vec![],
            archive: speaker_archive(),
        });
        let source = DriveArchiveSource::new(folder, "f1".into());

        let speakers = source.list_speakers().await.unwrap();
        assert_eq!(speakers.len(), 1);
        assert_eq!(speakers[0].display_name, "alice");
        assert_eq!(speakers[0].user_id, 0);

        let dir = tempfile::tempdir().unwrap();
        let tracks = source.fetch(dir.path()).await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert!(tracks[0].file_path.exists());
    }
}

//! Pipeline orchestrator: wires acquisition, transcription, merging,
//! generation and publishing into one bounded run per recording.
//!
//! `run()` is fired as a detached task and never propagates errors. It
//! enforces: at most one concurrent run per recording id, a fresh temp root
//! released on every exit path, strict stage order with per-stage timing,
//! and the error boundary (error embed + Failed status, then a normal
//! return).

use async_trait::async_trait;
use chrono::Local;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::detector::{RecordingHandle, TriggerKind};
use crate::drive::client::DriveFolder;
use crate::drive::{DriveArchiveSource, RecordingSink};
use crate::errors::{PipelineError, Result, Stage};
use crate::generator::MinutesGenerator;
use crate::merger;
use crate::publisher::chat::ChatPort;
use crate::publisher::{Publisher, StatusReporter};
use crate::source::cook::CookApiClient;
use crate::source::AudioSource;
use crate::transcription::Transcriber;

pub struct PipelineResult {
    pub recording_id: String,
    pub speaker_count: usize,
    pub total_audio_seconds: f64,
    pub stage_durations: HashMap<Stage, Duration>,
    pub posted_message_ids: Vec<u64>,
}

pub struct Orchestrator {
    cfg: Arc<Config>,
    http: reqwest::Client,
    transcriber: Arc<Transcriber>,
    generator: Arc<MinutesGenerator>,
    publisher: Publisher,
    drive: Option<Arc<dyn DriveFolder>>,
    active: Arc<Mutex<HashSet<String>>>,
    shutdown: watch::Receiver<bool>,
}

/// Claim on the process-wide active set; released on drop so the slot frees
/// on every exit path.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    recording_id: String,
}

impl ActiveGuard {
    fn try_claim(active: &Arc<Mutex<HashSet<String>>>, recording_id: &str) -> Option<Self> {
        let mut set = active.lock().expect("active set lock");
        if !set.insert(recording_id.to_string()) {
            return None;
        }
        Some(Self {
            active: Arc::clone(active),
            recording_id: recording_id.to_string(),
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.active.lock() {
            set.remove(&self.recording_id);
        }
    }
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Arc<Config>,
        http: reqwest::Client,
        transcriber: Arc<Transcriber>,
        generator: Arc<MinutesGenerator>,
        chat: Arc<dyn ChatPort>,
        drive: Option<Arc<dyn DriveFolder>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let publisher = Publisher::new(
            chat,
            cfg.chat.output_channel_id,
            cfg.publisher.clone(),
            cfg.chat.error_mention_role_id,
        );
        Self {
            cfg,
            http,
            transcriber,
            generator,
            publisher,
            drive,
            active: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    /// Number of pipeline runs currently in flight.
    pub fn active_count(&self) -> usize {
        self.active.lock().map(|set| set.len()).unwrap_or(0)
    }

    /// Run the full pipeline for one recording. Never propagates errors;
    /// failures are reported to the output channel and the log.
    pub async fn run(&self, handle: RecordingHandle) {
        if *self.shutdown.borrow() {
            info!(
                "Shutting down; trigger for recording {} refused",
                handle.recording_id
            );
            return;
        }

        let Some(_claim) = ActiveGuard::try_claim(&self.active, &handle.recording_id) else {
            info!(
                "duplicate trigger; ignored (recording_id={})",
                handle.recording_id
            );
            return;
        };

        info!(
            "Pipeline starting for recording {} (trigger={})",
            handle.recording_id,
            handle.trigger.as_str()
        );
        let started = Instant::now();
        let mut status = self.publisher.status_reporter();

        match self.execute(&handle, &mut status).await {
            Ok(result) => {
                status
                    .update(&format!("Complete ({}ms)", started.elapsed().as_millis()))
                    .await;
                info!(
                    "Pipeline complete for recording {} in {:.1}s ({} speakers, {:.1}s audio)",
                    result.recording_id,
                    started.elapsed().as_secs_f64(),
                    result.speaker_count,
                    result.total_audio_seconds
                );
                for (stage, duration) in &result.stage_durations {
                    debug!("Stage {stage}: {:.1}s", duration.as_secs_f64());
                }
            }
            Err(err) => {
                let stage = err.stage();
                error!(
                    "Pipeline failed for recording {} at stage '{stage}' after {:.1}s: {err}",
                    handle.recording_id,
                    started.elapsed().as_secs_f64()
                );
                status.update(&format!("Failed: {stage}")).await;
                if !err.is_silent() {
                    self.publisher
                        .post_error(stage, &err.to_string(), &handle.recording_id)
                        .await;
                }
            }
        }
    }

    /// The stage sequence. The temp root is owned by this frame and dropped
    /// (removed) on every exit path, including each `?`.
    async fn execute(
        &self,
        handle: &RecordingHandle,
        status: &mut StatusReporter,
    ) -> Result<PipelineResult> {
        status.update("Downloading audio...").await;

        let temp = tempfile::Builder::new()
            .prefix(&format!("minutes-{}-", handle.recording_id))
            .tempdir()
            .map_err(|e| PipelineError::Acquisition(format!("temp dir create failed: {e}")))?;

        let mut stage_durations: HashMap<Stage, Duration> = HashMap::new();

        let stage_start = Instant::now();
        let source = self.audio_source_for(handle)?;
        let speakers = source.list_speakers().await?;
        let tracks = source.fetch(temp.path()).await?;
        stage_durations.insert(Stage::Acquisition, stage_start.elapsed());

        let speaker_names = speakers
            .iter()
            .map(|s| s.display_name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let stage_start = Instant::now();
        let total = tracks.len();
        let mut transcripts = Vec::with_capacity(total);
        for (index, track) in tracks.iter().enumerate() {
            status
                .update(&format!(
                    "Transcribing {}/{} ({})...",
                    index + 1,
                    total,
                    track.speaker.display_name
                ))
                .await;
            transcripts.push(self.transcriber.transcribe(track).await?);
        }
        stage_durations.insert(Stage::Transcription, stage_start.elapsed());

        let stage_start = Instant::now();
        let mut transcript = merger::merge_transcripts(&transcripts, &self.cfg.merger)?;
        if transcript.is_empty() {
            info!("No speech detected for recording {}", handle.recording_id);
            transcript = "(no speech detected)".to_string();
        }
        stage_durations.insert(Stage::Merging, stage_start.elapsed());

        status.update("Generating minutes...").await;
        let date = Local::now().format("%Y-%m-%d %H:%M").to_string();
        let stage_start = Instant::now();
        let minutes = self
            .generator
            .generate(&transcript, &date, &speaker_names)
            .await?;
        stage_durations.insert(Stage::Generation, stage_start.elapsed());

        status.update("Posting minutes...").await;
        let total_audio_seconds = transcripts
            .iter()
            .flat_map(|t| &t.segments)
            .map(|segment| segment.end_sec)
            .fold(0.0f64, f64::max);
        let stage_start = Instant::now();
        let posted_message_ids = self
            .publisher
            .post_minutes(
                &minutes,
                &date,
                &speaker_names,
                total_audio_seconds,
                self.cfg
                    .publisher
                    .include_transcript
                    .then_some(transcript.as_str()),
            )
            .await?;
        stage_durations.insert(Stage::Posting, stage_start.elapsed());

        Ok(PipelineResult {
            recording_id: handle.recording_id.clone(),
            speaker_count: speakers.len(),
            total_audio_seconds,
            stage_durations,
            posted_message_ids,
        })
    }

    /// Pick the concrete audio source for the trigger kind.
    fn audio_source_for(&self, handle: &RecordingHandle) -> Result<Box<dyn AudioSource>> {
        match handle.trigger {
            TriggerKind::PanelEdit => Ok(Box::new(CookApiClient::new(
                self.http.clone(),
                handle.clone(),
                self.cfg.source.clone(),
            ))),
            TriggerKind::DriveFile => {
                let client = self.drive.clone().ok_or_else(|| {
                    PipelineError::Acquisition(
                        "drive-sourced recording but the drive client is not configured"
                            .to_string(),
                    )
                })?;
                let file_id = handle.drive_file_id.clone().ok_or_else(|| {
                    PipelineError::Acquisition(
                        "drive-sourced recording without a file id".to_string(),
                    )
                })?;
                Ok(Box::new(DriveArchiveSource::new(client, file_id)))
            }
        }
    }
}

#[async_trait]
impl RecordingSink for Orchestrator {
    async fn on_recording(&self, handle: RecordingHandle) {
        self.run(handle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_guard_claims_and_releases() {
        let active = Arc::new(Mutex::new(HashSet::new()));

        let first = ActiveGuard::try_claim(&active, "rec1");
        assert!(first.is_some());
        assert!(ActiveGuard::try_claim(&active, "rec1").is_none());
        assert!(ActiveGuard::try_claim(&active, "rec2").is_some());

        drop(first);
        assert!(ActiveGuard::try_claim(&active, "rec1").is_some());
    }
}

//! Transcription: the recognition engine seam and the accelerator guard.
//!
//! The engine is loaded once at startup and kept resident. Every call runs
//! under a process-wide accelerator mutex so concurrent pipelines never
//! touch the model at the same time, and the blocking inference is hosted
//! on a worker thread so the async runtime keeps serving events.

pub mod whisper;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::errors::{PipelineError, Result};
use crate::source::{AudioTrack, SpeakerInfo};

/// One transcribed utterance. `0 <= start_sec <= end_sec`; text is trimmed
/// and non-empty.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
}

/// All segments for one speaker, in non-decreasing start order.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakerTranscript {
    pub speaker: SpeakerInfo,
    pub segments: Vec<TranscriptSegment>,
}

/// Engine-level failures. Out-of-memory is distinguished so the pipeline
/// can surface it immediately instead of retrying.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("accelerator out of memory: {0}")]
    OutOfMemory(String),
    #[error("{0}")]
    Failed(String),
}

/// Blocking speech-recognition engine. Implementations own the loaded model.
pub trait SpeechEngine: Send + Sync {
    /// Transcribe one audio file into raw segments.
    fn transcribe_file(&self, path: &Path) -> std::result::Result<Vec<TranscriptSegment>, EngineError>;

    /// Human-readable engine/model description for status output.
    fn describe(&self) -> String;
}

/// Serializes engine access and tags segments with their speaker.
pub struct Transcriber {
    engine: Arc<dyn SpeechEngine>,
    accelerator: Mutex<()>,
}

impl Transcriber {
    pub fn new(engine: Arc<dyn SpeechEngine>) -> Self {
        Self {
            engine,
            accelerator: Mutex::new(()),
        }
    }

    pub fn describe(&self) -> String {
        self.engine.describe()
    }

    /// Transcribe one track. Holds the accelerator mutex for the duration of
    /// the engine call; released on every exit path when the guard drops.
    pub async fn transcribe(&self, track: &AudioTrack) -> Result<SpeakerTranscript> {
        let path: PathBuf = track.file_path.clone();
        if !path.exists() {
            return Err(PipelineError::Transcription(format!(
                "audio file not found: {}",
                path.display()
            )));
        }

        let _guard = self.accelerator.lock().await;

        info!(
            "Transcribing {} (speaker={})",
            path.display(),
            track.speaker.display_name
        );
        let started = Instant::now();

        let engine = Arc::clone(&self.engine);
        let outcome = tokio::task::spawn_blocking(move || engine.transcribe_file(&path))
            .await
            .map_err(|e| PipelineError::Transcription(format!("engine worker panicked: {e}")))?;

        let mut segments = match outcome {
            Ok(segments) => segments,
            Err(EngineError::OutOfMemory(message)) => {
                return Err(PipelineError::AcceleratorOom(message));
            }
            Err(EngineError::Failed(message)) => {
                return Err(PipelineError::Transcription(message));
            }
        };

        segments.retain(|segment| !segment.text.trim().is_empty());
        for segment in &mut segments {
            segment.text = segment.text.trim().to_string();
        }

        info!(
            "Transcribed {}: {} segments in {:.1}s",
            track.file_path.display(),
            segments.len(),
            started.elapsed().as_secs_f64()
        );

        Ok(SpeakerTranscript {
            speaker: track.speaker.clone(),
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn speaker(track: u32) -> SpeakerInfo {
        SpeakerInfo {
            track_index: track,
            display_name: format!("speaker{track}"),
            user_id: 0,
        }
    }

    fn track_at(path: &Path) -> AudioTrack {
        AudioTrack {
            speaker: speaker(1),
            file_path: path.to_path_buf(),
        }
    }

    struct FixedEngine(Vec<TranscriptSegment>);

    impl SpeechEngine for FixedEngine {
        fn transcribe_file(
            &self,
            _path: &Path,
        ) -> std::result::Result<Vec<TranscriptSegment>, EngineError> {
            Ok(self.0.clone())
        }
        fn describe(&self) -> String {
            "fixed".to_string()
        }
    }

    /// Counts how many calls are inside the engine at once.
    struct ConcurrencyProbe {
        inside: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl SpeechEngine for ConcurrencyProbe {
        fn transcribe_file(
            &self,
            _path: &Path,
        ) -> std::result::Result<Vec<TranscriptSegment>, EngineError> {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(30));
            self.inside.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![TranscriptSegment {
                start_sec: 0.0,
                end_sec: 1.0,
                text: "ok".to_string(),
            }])
        }
        fn describe(&self) -> String {
            "probe".to_string()
        }
    }

    struct OomEngine;

    impl SpeechEngine for OomEngine {
        fn transcribe_file(
            &self,
            _path: &Path,
        ) -> std::result::Result<Vec<TranscriptSegment>, EngineError> {
            Err(EngineError::OutOfMemory("CUDA out of memory".to_string()))
        }
        fn describe(&self) -> String {
            "oom".to_string()
        }
    }

    #[tokio::test]
    async fn missing_file_is_transcription_failure() {
        let transcriber = Transcriber::new(Arc::new(FixedEngine(vec![])));
        let err = transcriber
            .transcribe(&track_at(Path::new("/nonexistent/audio.wav")))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transcription(_)));
    }

    #[tokio::test]
    async fn oom_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("1-a.wav");
        std::fs::write(&file, b"riff").unwrap();

        let transcriber = Transcriber::new(Arc::new(OomEngine));
        let err = transcriber.transcribe(&track_at(&file)).await.unwrap_err();
        assert!(matches!(err, PipelineError::AcceleratorOom(_)));
    }

    #[tokio::test]
    async fn empty_segments_are_dropped_and_text_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("1-a.wav");
        std::fs::write(&file, b"riff").unwrap();

        let engine = FixedEngine(vec![
            TranscriptSegment {
                start_sec: 0.0,
                end_sec: 1.0,
                text: "  hello  ".to_string(),
            },
            TranscriptSegment {
                start_sec: 1.0,
                end_sec: 2.0,
                text: "   ".to_string(),
            },
        ]);
        let transcriber = Transcriber::new(Arc::new(engine));
        let result = transcriber.transcribe(&track_at(&file)).await.unwrap();
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].text, "hello");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("1-a.wav");
        std::fs::write(&file, b"riff").unwrap();

        let probe = Arc::new(ConcurrencyProbe {
            inside: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let transcriber = Arc::new(Transcriber::new(probe.clone() as Arc<dyn SpeechEngine>));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let transcriber = Arc::clone(&transcriber);
            let track = track_at(&file);
            handles.push(tokio::spawn(async move {
                transcriber.transcribe(&track).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(probe.max_seen.load(Ordering::SeqCst), 1);
    }
}

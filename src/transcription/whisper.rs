//! Whisper-backed speech engine.
//!
//! Requires the `whisper` cargo feature (whisper-rs needs cmake and a C++
//! toolchain). Without the feature a stub engine is built that fails at
//! call time, keeping the rest of the service testable.

use std::path::{Path, PathBuf};

use crate::config::RecognizerConfig;
use crate::errors::Result;
use crate::transcription::{EngineError, SpeechEngine, TranscriptSegment};

#[cfg(feature = "whisper")]
use crate::errors::PipelineError;
#[cfg(feature = "whisper")]
use std::sync::Once;
#[cfg(feature = "whisper")]
use whisper_rs::{
    install_logging_hooks, FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters,
};

#[cfg(feature = "whisper")]
static LOGGING_HOOKS: Once = Once::new();

/// Resolve a model name to a file path. A value that points at an existing
/// file is used as-is; otherwise it is looked up under `models/`.
fn resolve_model_path(model: &str) -> PathBuf {
    let direct = PathBuf::from(model);
    if direct.exists() {
        direct
    } else {
        PathBuf::from(format!("models/ggml-{model}.bin"))
    }
}

#[cfg(feature = "whisper")]
pub struct WhisperEngine {
    context: WhisperContext,
    cfg: RecognizerConfig,
    model_path: PathBuf,
}

#[cfg(feature = "whisper")]
impl WhisperEngine {
    /// Load the model once; the context stays resident for the process
    /// lifetime.
    pub fn load(cfg: &RecognizerConfig) -> Result<Self> {
        LOGGING_HOOKS.call_once(install_logging_hooks);

        let model_path = resolve_model_path(&cfg.model);
        if !model_path.exists() {
            return Err(PipelineError::Config(format!(
                "recognizer model not found: {}",
                model_path.display()
            )));
        }

        let mut params = WhisperContextParameters::default();
        params.use_gpu(cfg.device != "cpu");

        let context = WhisperContext::new_with_params(
            model_path
                .to_str()
                .ok_or_else(|| PipelineError::Config("model path is not valid UTF-8".into()))?,
            params,
        )
        .map_err(|e| PipelineError::Config(format!("failed to load recognizer model: {e}")))?;

        tracing::info!(
            "Recognizer model loaded from {} (device={}, compute={})",
            model_path.display(),
            cfg.device,
            cfg.compute_type
        );

        Ok(Self {
            context,
            cfg: cfg.clone(),
            model_path,
        })
    }

    fn read_wav_samples(path: &Path) -> std::result::Result<Vec<f32>, EngineError> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| EngineError::Failed(format!("cannot open {}: {e}", path.display())))?;
        let spec = reader.spec();
        if spec.channels != 1 || spec.sample_rate != 16_000 {
            return Err(EngineError::Failed(format!(
                "{} must be 16kHz mono WAV (got {}ch {}Hz); transcode upstream",
                path.display(),
                spec.channels,
                spec.sample_rate
            )));
        }

        match spec.sample_format {
            hound::SampleFormat::Int => reader
                .into_samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0))
                .collect::<std::result::Result<Vec<f32>, _>>()
                .map_err(|e| EngineError::Failed(format!("corrupt WAV {}: {e}", path.display()))),
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<std::result::Result<Vec<f32>, _>>()
                .map_err(|e| EngineError::Failed(format!("corrupt WAV {}: {e}", path.display()))),
        }
    }

    fn classify(message: String) -> EngineError {
        let lower = message.to_lowercase();
        if lower.contains("out of memory") || lower.contains("cuda") {
            EngineError::OutOfMemory(message)
        } else {
            EngineError::Failed(message)
        }
    }
}

#[cfg(feature = "whisper")]
impl SpeechEngine for WhisperEngine {
    fn transcribe_file(
        &self,
        path: &Path,
    ) -> std::result::Result<Vec<TranscriptSegment>, EngineError> {
        let samples = Self::read_wav_samples(path)?;

        let mut state = self
            .context
            .create_state()
            .map_err(|e| Self::classify(format!("failed to create recognizer state: {e}")))?;

        let mut params = FullParams::new(SamplingStrategy::BeamSearch {
            beam_size: self.cfg.beam_size as i32,
            patience: -1.0,
        });
        params.set_language(Some(&self.cfg.language));
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_suppress_blank(self.cfg.vad_filter);

        state
            .full(params, &samples)
            .map_err(|e| Self::classify(format!("recognition failed for {}: {e}", path.display())))?;

        let count = state
            .full_n_segments()
            .map_err(|e| EngineError::Failed(format!("segment count failed: {e}")))?;

        let mut segments = Vec::with_capacity(count as usize);
        for i in 0..count {
            let text = state
                .full_get_segment_text(i)
                .map_err(|e| EngineError::Failed(format!("segment text failed: {e}")))?;
            let t0 = state
                .full_get_segment_t0(i)
                .map_err(|e| EngineError::Failed(format!("segment start failed: {e}")))?;
            let t1 = state
                .full_get_segment_t1(i)
                .map_err(|e| EngineError::Failed(format!("segment end failed: {e}")))?;

            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            // Timestamps arrive in 10ms ticks.
            segments.push(TranscriptSegment {
                start_sec: t0 as f64 * 0.01,
                end_sec: t1 as f64 * 0.01,
                text: trimmed.to_string(),
            });
        }

        Ok(segments)
    }

    fn describe(&self) -> String {
        format!(
            "whisper {} ({})",
            self.cfg.model,
            self.model_path.display()
        )
    }
}

/// Stub engine built when the `whisper` feature is off.
#[cfg(not(feature = "whisper"))]
pub struct WhisperEngine {
    cfg: RecognizerConfig,
}

#[cfg(not(feature = "whisper"))]
impl WhisperEngine {
    pub fn load(cfg: &RecognizerConfig) -> Result<Self> {
        tracing::warn!(
            "Built without the `whisper` feature; model {} would load from {} but \
             transcription calls will fail",
            cfg.model,
            resolve_model_path(&cfg.model).display()
        );
        Ok(Self { cfg: cfg.clone() })
    }
}

#[cfg(not(feature = "whisper"))]
impl SpeechEngine for WhisperEngine {
    fn transcribe_file(
        &self,
        _path: &Path,
    ) -> std::result::Result<Vec<TranscriptSegment>, EngineError> {
        Err(EngineError::Failed(
            "recognizer unavailable: rebuild with --features whisper".to_string(),
        ))
    }

    fn describe(&self) -> String {
        format!("whisper {} (feature disabled)", self.cfg.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_name_resolves_under_models_dir() {
        let path = resolve_model_path("large-v3");
        assert_eq!(path, PathBuf::from("models/ggml-large-v3.bin"));
    }

    #[test]
    fn existing_path_is_used_directly() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = resolve_model_path(file.path().to_str().unwrap());
        assert_eq!(path, file.path());
    }

    #[cfg(not(feature = "whisper"))]
    #[test]
    fn stub_engine_fails_at_call_time() {
        let engine = WhisperEngine::load(&RecognizerConfig::default()).unwrap();
        let err = engine.transcribe_file(Path::new("x.wav")).unwrap_err();
        assert!(err.to_string().contains("whisper"));
    }
}

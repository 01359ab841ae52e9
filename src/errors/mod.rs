//! Failure taxonomy for the minutes pipeline.
//!
//! Every variant maps to the pipeline stage it belongs to; the stage tag
//! drives the status line, the error embed, and log context.

use thiserror::Error;

/// Pipeline stage names used in logs, the status line, and error embeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Detection,
    Acquisition,
    Transcription,
    Merging,
    Generation,
    Posting,
    DriveWatch,
    Config,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Acquisition => "audio_acquisition",
            Self::Transcription => "transcription",
            Self::Merging => "merging",
            Self::Generation => "generation",
            Self::Posting => "posting",
            Self::DriveWatch => "drive_watch",
            Self::Config => "config",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("detection failed: {0}")]
    Detection(String),

    #[error("audio acquisition failed: {0}")]
    Acquisition(String),

    #[error("audio acquisition timed out: {0}")]
    AcquisitionTimeout(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("accelerator out of memory: {0}")]
    AcceleratorOom(String),

    #[error("transcript merge failed: {0}")]
    Merge(String),

    #[error("minutes generation failed: {0}")]
    Generation(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("drive watch failed: {0}")]
    DriveWatch(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Detection(_) => Stage::Detection,
            Self::Acquisition(_) | Self::AcquisitionTimeout(_) => Stage::Acquisition,
            Self::Transcription(_) | Self::AcceleratorOom(_) => Stage::Transcription,
            Self::Merge(_) => Stage::Merging,
            Self::Generation(_) => Stage::Generation,
            Self::Publish(_) => Stage::Posting,
            Self::DriveWatch(_) => Stage::DriveWatch,
            Self::Config(_) => Stage::Config,
        }
    }

    /// Errors that must never be reported to the output channel.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Detection(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_tags() {
        assert_eq!(
            PipelineError::Acquisition("x".into()).stage(),
            Stage::Acquisition
        );
        assert_eq!(
            PipelineError::AcquisitionTimeout("x".into()).stage(),
            Stage::Acquisition
        );
        assert_eq!(
            PipelineError::AcceleratorOom("x".into()).stage(),
            Stage::Transcription
        );
        assert_eq!(PipelineError::Publish("x".into()).stage(), Stage::Posting);
    }

    #[test]
    fn detection_is_silent() {
        assert!(PipelineError::Detection("x".into()).is_silent());
        assert!(!PipelineError::Generation("x".into()).is_silent());
    }

    #[test]
    fn stage_display() {
        assert_eq!(Stage::Transcription.to_string(), "transcription");
        assert_eq!(Stage::Acquisition.to_string(), "audio_acquisition");
    }
}

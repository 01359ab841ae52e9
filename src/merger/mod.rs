//! Chronological interleaving of per-speaker transcripts.
//!
//! Pure: sorts flattened segments by start time (ties by track index),
//! optionally coalesces consecutive same-speaker segments, and renders one
//! `[MM:SS] name: text` line per surviving segment.

use std::cmp::Ordering;
use tracing::info;

use crate::config::MergerConfig;
use crate::errors::{PipelineError, Result};
use crate::transcription::SpeakerTranscript;

#[derive(Debug, Clone)]
struct FlatSegment {
    start_sec: f64,
    end_sec: f64,
    text: String,
    display_name: String,
    track_index: u32,
}

fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("[{:02}:{:02}]", total / 60, total % 60)
}

/// Merge per-speaker transcripts into one chronological transcript.
///
/// Errors only when `transcripts` is empty. All-silent input yields an
/// empty string; the caller decides how to present that.
pub fn merge_transcripts(
    transcripts: &[SpeakerTranscript],
    cfg: &MergerConfig,
) -> Result<String> {
    if transcripts.is_empty() {
        return Err(PipelineError::Merge(
            "no speaker transcripts to merge".to_string(),
        ));
    }

    let mut flat: Vec<FlatSegment> = Vec::new();
    for transcript in transcripts {
        for segment in &transcript.segments {
            let text = segment.text.trim();
            if text.is_empty() || text.chars().count() < cfg.min_segment_chars {
                continue;
            }
            flat.push(FlatSegment {
                start_sec: segment.start_sec,
                end_sec: segment.end_sec,
                text: text.to_string(),
                display_name: transcript.speaker.display_name.clone(),
                track_index: transcript.speaker.track_index,
            });
        }
    }

    let raw_count = flat.len();

    flat.sort_by(|a, b| {
        a.start_sec
            .partial_cmp(&b.start_sec)
            .unwrap_or(Ordering::Equal)
            .then(a.track_index.cmp(&b.track_index))
    });

    // Coalesce consecutive same-speaker segments within the gap threshold.
    let mut merged: Vec<FlatSegment> = Vec::with_capacity(flat.len());
    for segment in flat {
        if let Some(previous) = merged.last_mut() {
            let gap = (segment.start_sec - previous.end_sec).max(0.0);
            if previous.track_index == segment.track_index
                && cfg.gap_merge_threshold_sec > 0.0
                && gap < cfg.gap_merge_threshold_sec
            {
                previous.text.push(' ');
                previous.text.push_str(&segment.text);
                previous.end_sec = segment.end_sec;
                continue;
            }
        }
        merged.push(segment);
    }

    let lines: Vec<String> = merged
        .iter()
        .map(|segment| {
            format!(
                "{} {}: {}",
                format_timestamp(segment.start_sec),
                segment.display_name,
                segment.text
            )
        })
        .collect();

    info!(
        "Merged {} raw segments into {} lines ({} speakers)",
        raw_count,
        lines.len(),
        transcripts.len()
    );

    Ok(lines.join("\n"))
}

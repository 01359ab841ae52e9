//! Embed construction and text shaping for published messages.

use chrono::Utc;

use crate::config::PublisherConfig;
use crate::errors::Stage;
use crate::publisher::chat::{Embed, EmbedField, EmbedFooter};

const ERROR_COLOR: u32 = 0xED4245;
const SEE_ATTACHED_NOTE: &str = "\n\n*(continued in the attached file)*";

/// Truncate `text` to at most `max` characters, cutting at a line boundary
/// and appending a "see attached" note when anything was dropped.
pub fn truncate_for_embed(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }

    let note_len = SEE_ATTACHED_NOTE.chars().count();
    let budget = max.saturating_sub(note_len);

    let cut_at: usize = text
        .char_indices()
        .nth(budget)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let head = &text[..cut_at];

    // Prefer the last whole line; fall back to the raw cut when the text is
    // one giant line.
    let truncated = match head.rfind('\n') {
        Some(newline) if newline > 0 => &head[..newline],
        _ => head,
    };

    format!("{}{}", truncated.trim_end(), SEE_ATTACHED_NOTE)
}

pub fn format_duration(total_seconds: f64) -> String {
    let total = total_seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else {
        format!("{minutes}m {seconds:02}s")
    }
}

/// Filename for the attached minutes markdown.
pub fn minutes_filename(date: &str) -> String {
    let safe: String = date
        .chars()
        .map(|c| match c {
            '/' | ' ' | ':' => '_',
            other => other,
        })
        .collect();
    format!("minutes_{safe}.md")
}

/// Embed summarising the generated minutes; the full text always travels in
/// the attachment.
pub fn build_minutes_embed(
    minutes_md: &str,
    date: &str,
    speakers: &str,
    total_audio_seconds: f64,
    cfg: &PublisherConfig,
) -> Embed {
    let mut fields = Vec::new();
    if !speakers.is_empty() {
        fields.push(EmbedField {
            name: "Participants".to_string(),
            value: speakers.to_string(),
            inline: false,
        });
    }
    fields.push(EmbedField {
        name: "Duration".to_string(),
        value: format_duration(total_audio_seconds),
        inline: true,
    });

    Embed {
        title: format!("Meeting minutes {date}"),
        description: Some(truncate_for_embed(minutes_md, cfg.max_embed_length)),
        color: cfg.embed_color,
        fields,
        footer: Some(EmbedFooter {
            text: "Full minutes attached".to_string(),
        }),
        timestamp: Some(Utc::now().to_rfc3339()),
    }
}

/// Red error embed with the failed stage and recording id.
pub fn build_error_embed(stage: Stage, message: &str, recording_id: &str) -> Embed {
    let short: String = message.chars().take(1000).collect();
    Embed {
        title: "Minutes pipeline failed".to_string(),
        description: Some(short),
        color: ERROR_COLOR,
        fields: vec![
            EmbedField {
                name: "Stage".to_string(),
                value: stage.to_string(),
                inline: true,
            },
            EmbedField {
                name: "Recording".to_string(),
                value: recording_id.to_string(),
                inline: true,
            },
        ],
        footer: None,
        timestamp: Some(Utc::now().to_rfc3339()),
    }
}

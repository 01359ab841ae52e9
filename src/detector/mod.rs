//! Recording-ended detection from raw message-edit payloads.
//!
//! The recording bot edits its in-channel panel when a recording stops. The
//! detector operates on the serialized JSON text of the payload rather than
//! the evolving component schema: a substring check for the ended marker and
//! a URL pattern search over the whole document.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// What initiated a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    PanelEdit,
    DriveFile,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PanelEdit => "panel-edit",
            Self::DriveFile => "drive-file",
        }
    }
}

/// Coordinates of one recording, passed by value through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingHandle {
    pub recording_id: String,
    /// Empty for drive-sourced recordings.
    pub access_key: String,
    pub origin_channel_id: u64,
    pub trigger: TriggerKind,
    pub drive_file_id: Option<String>,
    /// Host the recording URL was extracted from; empty for drive-sourced.
    pub source_domain: String,
}

/// Raw message-edit event as delivered to the intake endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageEditEvent {
    pub channel_id: u64,
    /// The gateway payload data, untouched.
    pub data: Value,
}

/// The marker text the recording bot writes into its panel components.
/// Treated as a versionable detection rule: upstream UI revisions land here.
const RECORDING_ENDED_MARKER: &str = "Recording ended";

fn recording_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"https?://([A-Za-z0-9][A-Za-z0-9.-]*)/rec/([A-Za-z0-9]+)\?key=([A-Za-z0-9]+)")
            .expect("recording url regex is valid")
    })
}

/// Classifies panel-edit events and extracts recording coordinates.
pub struct PanelDetector {
    bot_id: u64,
    watch_channel_id: u64,
    domain_allowlist: Vec<String>,
}

impl PanelDetector {
    pub fn new(bot_id: u64, watch_channel_id: u64, domain_allowlist: Vec<String>) -> Self {
        Self {
            bot_id,
            watch_channel_id,
            domain_allowlist,
        }
    }

    /// Apply the detection filters in order; the first miss yields `None`.
    ///
    /// 1. author is the recording bot, 2. channel is the watch channel,
    /// 3. the panel components contain the ended marker, 4. a recording URL
    /// with an allowlisted host occurs anywhere in the payload.
    pub fn detect(&self, event: &MessageEditEvent) -> Option<RecordingHandle> {
        if !self.is_recorder_message(&event.data) {
            return None;
        }

        if event.channel_id != self.watch_channel_id {
            return None;
        }

        if !Self::is_recording_ended(&event.data) {
            return None;
        }

        let serialized = event.data.to_string();
        let Some((domain, recording_id, access_key)) =
            extract_recording_url(&serialized, &self.domain_allowlist)
        else {
            warn!(
                "Recording-ended panel detected but no recording URL found (channel={})",
                event.channel_id
            );
            return None;
        };

        Some(RecordingHandle {
            recording_id,
            access_key,
            origin_channel_id: event.channel_id,
            trigger: TriggerKind::PanelEdit,
            drive_file_id: None,
            source_domain: domain,
        })
    }

    fn is_recorder_message(&self, data: &Value) -> bool {
        let Some(author) = data.get("author") else {
            return false;
        };
        match author.get("id") {
            Some(Value::String(id)) => id == &self.bot_id.to_string(),
            Some(Value::Number(id)) => id.as_u64() == Some(self.bot_id),
            _ => false,
        }
    }

    fn is_recording_ended(data: &Value) -> bool {
        let Some(components) = data.get("components") else {
            return false;
        };
        if components.is_null() {
            return false;
        }
        let serialized = components.to_string();
        let ended = serialized.contains(RECORDING_ENDED_MARKER);
        if !ended {
            debug!("Panel edit without ended marker ignored");
        }
        ended
    }
}

/// Find the first recording URL with an allowlisted host in `text`.
///
/// Returns `(domain, recording_id, access_key)`. Shared by the detector and
/// the manual `/process` trigger.
pub fn extract_recording_url(
    text: &str,
    domain_allowlist: &[String],
) -> Option<(String, String, String)> {
    for caps in recording_url_pattern().captures_iter(text) {
        let domain = &caps[1];
        if domain_allowlist
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(domain))
        {
            return Some((
                domain.to_string(),
                caps[2].to_string(),
                caps[3].to_string(),
            ));
        }
        debug!("Recording URL with non-allowlisted host {domain} ignored");
    }
    None
}

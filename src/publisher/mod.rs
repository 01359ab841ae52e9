//! Publishing: the evolving status line, the final minutes post, and the
//! error embed.
//!
//! Status writes are non-raising: a failed edit is logged and swallowed so
//! progress reporting can never abort the pipeline. The final post retries
//! once on server-side or transport failures.

pub mod chat;
pub mod embed;

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::PublisherConfig;
use crate::errors::{PipelineError, Result, Stage};
use chat::{Attachment, ChatPort, OutboundMessage};

pub struct Publisher {
    chat: Arc<dyn ChatPort>,
    channel_id: u64,
    cfg: PublisherConfig,
    error_mention_role_id: Option<u64>,
}

impl Publisher {
    pub fn new(
        chat: Arc<dyn ChatPort>,
        channel_id: u64,
        cfg: PublisherConfig,
        error_mention_role_id: Option<u64>,
    ) -> Self {
        Self {
            chat,
            channel_id,
            cfg,
            error_mention_role_id,
        }
    }

    pub fn status_reporter(&self) -> StatusReporter {
        StatusReporter {
            chat: Arc::clone(&self.chat),
            channel_id: self.channel_id,
            message_id: None,
        }
    }

    /// Post the summary embed plus the full minutes as a markdown
    /// attachment; optionally the raw transcript as a second attachment.
    ///
    /// Retries once when the failure is server-side or transport-level.
    pub async fn post_minutes(
        &self,
        minutes_md: &str,
        date: &str,
        speakers: &str,
        total_audio_seconds: f64,
        transcript: Option<&str>,
    ) -> Result<Vec<u64>> {
        let mut attachments = vec![Attachment {
            filename: embed::minutes_filename(date),
            bytes: minutes_md.as_bytes().to_vec(),
        }];
        if let Some(transcript) = transcript {
            attachments.push(Attachment {
                filename: "transcript.md".to_string(),
                bytes: transcript.as_bytes().to_vec(),
            });
        }

        let message = OutboundMessage {
            content: None,
            embed: Some(embed::build_minutes_embed(
                minutes_md,
                date,
                speakers,
                total_audio_seconds,
                &self.cfg,
            )),
            attachments,
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.chat.send(self.channel_id, &message).await {
                Ok(message_id) => {
                    info!(
                        "Minutes posted to channel {} (message_id={message_id})",
                        self.channel_id
                    );
                    return Ok(vec![message_id]);
                }
                Err(err) if err.is_retryable() && attempts == 1 => {
                    warn!("Minutes post failed, retrying once: {err}");
                }
                Err(err) => {
                    return Err(PipelineError::Publish(format!(
                        "minutes post failed: {err}"
                    )));
                }
            }
        }
    }

    /// Best-effort error report to the output channel. Never raises; a
    /// failed error post is only logged.
    pub async fn post_error(&self, stage: Stage, message: &str, recording_id: &str) {
        let content = self
            .error_mention_role_id
            .map(|role_id| format!("<@&{role_id}>"));

        let outbound = OutboundMessage {
            content,
            embed: Some(embed::build_error_embed(stage, message, recording_id)),
            attachments: vec![],
        };

        match self.chat.send(self.channel_id, &outbound).await {
            Ok(message_id) => info!(
                "Error posted for recording {recording_id} (stage={stage}, message_id={message_id})"
            ),
            Err(err) => warn!("Error embed post failed (stage={stage}): {err}"),
        }
    }
}

/// One evolving status message, edited as the pipeline advances.
pub struct StatusReporter {
    chat: Arc<dyn ChatPort>,
    channel_id: u64,
    message_id: Option<u64>,
}

impl StatusReporter {
    /// Create or edit the status message. Failures are logged and swallowed.
    pub async fn update(&mut self, text: &str) {
        match self.message_id {
            None => match self
                .chat
                .send(self.channel_id, &OutboundMessage::text(text))
                .await
            {
                Ok(message_id) => self.message_id = Some(message_id),
                Err(err) => warn!("Status post failed (non-critical): {err}"),
            },
            Some(message_id) => {
                if let Err(err) = self
                    .chat
                    .edit_text(self.channel_id, message_id, text)
                    .await
                {
                    warn!("Status edit failed (non-critical): {err}");
                }
            }
        }
    }
}

//! Chat transport seam and the Discord REST implementation.
//!
//! The publisher only depends on the `ChatPort` trait; the concrete client
//! speaks the Discord REST API with bot-token auth, using multipart uploads
//! when a message carries attachments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat API returned HTTP {code}: {message}")]
    Status { code: u16, message: String },
    #[error("chat transport error: {0}")]
    Transport(String),
}

impl ChatError {
    /// Server-side and transport failures are worth one more attempt;
    /// client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { code, .. } => (500..600).contains(code),
            Self::Transport(_) => true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

/// File attached to an outbound message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// One outbound channel message: plain content, an embed, attachments, in
/// any combination.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub content: Option<String>,
    pub embed: Option<Embed>,
    pub attachments: Vec<Attachment>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

/// Minimal chat surface the publisher needs: send a message, edit a text
/// message in place.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Send a message to a channel; returns the new message id.
    async fn send(&self, channel_id: u64, message: &OutboundMessage) -> Result<u64, ChatError>;

    /// Replace the content of an existing message.
    async fn edit_text(
        &self,
        channel_id: u64,
        message_id: u64,
        content: &str,
    ) -> Result<(), ChatError>;
}

pub struct DiscordRestClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    id: String,
}

impl DiscordRestClient {
    pub fn new(http: reqwest::Client, token: String) -> Self {
        Self {
            http,
            token,
            base_url: DISCORD_API_BASE.to_string(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }

    fn payload_json(message: &OutboundMessage) -> serde_json::Value {
        let mut payload = serde_json::Map::new();
        if let Some(content) = &message.content {
            payload.insert("content".into(), serde_json::Value::String(content.clone()));
        }
        if let Some(embed) = &message.embed {
            payload.insert(
                "embeds".into(),
                serde_json::json!([serde_json::to_value(embed).unwrap_or_default()]),
            );
        }
        serde_json::Value::Object(payload)
    }

    async fn parse_message_id(response: reqwest::Response) -> Result<u64, ChatError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(ChatError::Status {
                code: status.as_u16(),
                message: truncate(&body, 300).to_string(),
            });
        }

        let parsed: MessageResponse = serde_json::from_str(&body)
            .map_err(|e| ChatError::Transport(format!("unparseable send response: {e}")))?;
        parsed
            .id
            .parse()
            .map_err(|e| ChatError::Transport(format!("non-numeric message id: {e}")))
    }
}

#[async_trait]
impl ChatPort for DiscordRestClient {
    async fn send(&self, channel_id: u64, message: &OutboundMessage) -> Result<u64, ChatError> {
        let url = format!("{}/channels/{channel_id}/messages", self.base_url);
        let payload = Self::payload_json(message);

        let request = self.http.post(&url).header("Authorization", self.auth_header());

        let response = if message.attachments.is_empty() {
            request
                .json(&payload)
                .send()
                .await
                .map_err(|e| ChatError::Transport(e.to_string()))?
        } else {
            let mut form = reqwest::multipart::Form::new()
                .text("payload_json", payload.to_string());
            for (index, attachment) in message.attachments.iter().enumerate() {
                let part = reqwest::multipart::Part::bytes(attachment.bytes.clone())
                    .file_name(attachment.filename.clone())
                    .mime_str("text/markdown")
                    .map_err(|e| ChatError::Transport(e.to_string()))?;
                form = form.part(format!("files[{index}]"), part);
            }
            request
                .multipart(form)
                .send()
                .await
                .map_err(|e| ChatError::Transport(e.to_string()))?
        };

        Self::parse_message_id(response).await
    }

    async fn edit_text(
        &self,
        channel_id: u64,
        message_id: u64,
        content: &str,
    ) -> Result<(), ChatError> {
        let url = format!(
            "{}/channels/{channel_id}/messages/{message_id}",
            self.base_url
        );
        let response = self
            .http
            .patch(&url)
            .header("Authorization", self.auth_header())
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Status {
                code: status.as_u16(),
                message: truncate(&body, 300).to_string(),
            });
        }
        Ok(())
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ChatError::Transport("reset".into()).is_retryable());
        assert!(ChatError::Status {
            code: 502,
            message: String::new()
        }
        .is_retryable());
        assert!(!ChatError::Status {
            code: 403,
            message: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn payload_json_includes_content_and_embed() {
        let message = OutboundMessage {
            content: Some("hello".into()),
            embed: Some(Embed {
                title: "t".into(),
                color: 1,
                ..Embed::default()
            }),
            attachments: vec![],
        };
        let payload = DiscordRestClient::payload_json(&message);
        assert_eq!(payload["content"], "hello");
        assert_eq!(payload["embeds"][0]["title"], "t");
    }

    #[test]
    fn payload_json_omits_absent_parts() {
        let payload = DiscordRestClient::payload_json(&OutboundMessage::text("status"));
        assert_eq!(payload["content"], "status");
        assert!(payload.get("embeds").is_none());
    }

    #[test]
    fn embed_serializes_without_empty_collections() {
        let embed = Embed {
            title: "t".into(),
            color: 0xFF0000,
            ..Embed::default()
        };
        let value = serde_json::to_value(&embed).unwrap();
        assert!(value.get("fields").is_none());
        assert!(value.get("footer").is_none());
    }
}

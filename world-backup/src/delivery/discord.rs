//! Discord REST client.
//!
//! Talks to the bot HTTP API directly:
//! - `GET /users/@me` once at startup to check the token
//! - `POST /channels/{id}/messages` with a multipart body for attachments
//! - `POST /channels/{id}/messages` with a JSON body for text

use super::{Attachment, DeliveryClient, MessageId};
use crate::config::{DiscordConfig, DiscordToken};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Discord rejects messages with more files than this.
pub const MAX_ATTACHMENTS_PER_MESSAGE: usize = 10;

/// Longest message content Discord accepts, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
}

pub struct DiscordClient {
    client: reqwest::Client,
    api_base: String,
    token: DiscordToken,
    max_attachment_bytes: u64,
}

impl DiscordClient {
    /// Create a client without contacting Discord.
    pub fn new(token: DiscordToken, config: &DiscordConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(
                "DiscordBot (world-backup, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            ))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token,
            max_attachment_bytes: config.max_attachment_bytes,
        })
    }

    /// Create a client and verify the token. Any failure is fatal at startup.
    pub async fn connect(token: DiscordToken, config: &DiscordConfig) -> Result<Self> {
        let client = Self::new(token, config)?;
        client.authenticate().await?;
        Ok(client)
    }

    async fn authenticate(&self) -> Result<()> {
        let resp = self
            .client
            .get(self.url("/users/@me"))
            .header("authorization", self.token.authorization())
            .send()
            .await
            .map_err(|e| BackupError::Startup(format!("unable to reach Discord: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackupError::Startup(format!(
                "unable to create discord session: {} {}",
                status, body
            )));
        }

        let user: DiscordUser = resp
            .json()
            .await
            .map_err(|e| BackupError::Startup(format!("invalid Discord user response: {}", e)))?;
        info!("Connected to Discord as {} ({})", user.username, user.id);
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn messages_url(&self, channel: &str) -> String {
        self.url(&format!("/channels/{}/messages", channel))
    }

    async fn post_files(
        &self,
        channel: &str,
        caption: Option<&str>,
        batch: Vec<Attachment>,
    ) -> Result<MessageId> {
        let descriptors: Vec<serde_json::Value> = batch
            .iter()
            .enumerate()
            .map(|(idx, a)| serde_json::json!({ "id": idx, "filename": a.name }))
            .collect();
        let mut payload = serde_json::json!({ "attachments": descriptors });
        if let Some(caption) = caption {
            payload["content"] = serde_json::Value::from(caption);
        }

        let mut form = Form::new().text("payload_json", serde_json::to_string(&payload)?);
        for (idx, attachment) in batch.into_iter().enumerate() {
            let body = reqwest::Body::wrap_stream(ReaderStream::new(attachment.file));
            let part = Part::stream_with_length(body, attachment.size)
                .file_name(attachment.name)
                .mime_str(&attachment.content_type)?;
            form = form.part(format!("files[{}]", idx), part);
        }

        let resp = self
            .client
            .post(self.messages_url(channel))
            .header("authorization", self.token.authorization())
            .multipart(form)
            .send()
            .await?;

        message_id(resp).await
    }
}

async fn message_id(resp: reqwest::Response) -> Result<MessageId> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(BackupError::Delivery(format!(
            "Discord returned {}: {}",
            status, body
        )));
    }

    let message: DiscordMessage = resp.json().await?;
    Ok(MessageId(message.id))
}

#[async_trait]
impl DeliveryClient for DiscordClient {
    async fn send_with_attachments(
        &self,
        channel: &str,
        caption: &str,
        attachments: Vec<Attachment>,
    ) -> Result<MessageId> {
        if let Some(large) = attachments
            .iter()
            .find(|a| a.size > self.max_attachment_bytes)
        {
            return Err(BackupError::Delivery(format!(
                "{} is {} bytes, above the {} byte attachment limit",
                large.name, large.size, self.max_attachment_bytes
            )));
        }

        if attachments.is_empty() {
            return self.send_text(channel, caption).await;
        }

        let total = attachments.len();
        let mut remaining = attachments.into_iter();
        let mut first_id = None;
        let mut sent = 0usize;

        loop {
            let batch: Vec<Attachment> = remaining
                .by_ref()
                .take(MAX_ATTACHMENTS_PER_MESSAGE)
                .collect();
            if batch.is_empty() {
                break;
            }
            sent += batch.len();

            let caption = first_id.is_none().then_some(caption);
            let id = self.post_files(channel, caption, batch).await?;
            debug!("Posted message {} ({}/{} files)", id, sent, total);
            first_id.get_or_insert(id);
        }

        first_id.ok_or_else(|| BackupError::Delivery("no message was posted".into()))
    }

    async fn send_text(&self, channel: &str, text: &str) -> Result<MessageId> {
        let content: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
        let resp = self
            .client
            .post(self.messages_url(channel))
            .header("authorization", self.token.authorization())
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await?;

        message_id(resp).await
    }
}

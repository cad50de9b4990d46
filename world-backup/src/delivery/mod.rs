//! Delivery of backups to a chat channel.

pub mod discord;

use crate::fs::collector::CollectedFile;
use crate::utils::errors::Result;
use async_trait::async_trait;

pub use discord::DiscordClient;

/// Id of a message posted to the destination channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file to upload. The handle is closed once the upload consumed it or
/// the attachment is dropped.
#[derive(Debug)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub file: tokio::fs::File,
}

impl From<CollectedFile> for Attachment {
    fn from(collected: CollectedFile) -> Self {
        Self {
            name: collected.name,
            content_type: collected.content_type.to_string(),
            size: collected.size,
            file: tokio::fs::File::from_std(collected.file),
        }
    }
}

/// Something that can post to the destination channel.
///
/// Neither method retries; callers decide what a failure means.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Post `caption` with the given files attached.
    async fn send_with_attachments(
        &self,
        channel: &str,
        caption: &str,
        attachments: Vec<Attachment>,
    ) -> Result<MessageId>;

    /// Post a plain text message.
    async fn send_text(&self, channel: &str, text: &str) -> Result<MessageId>;
}

//! Mailbox access: unread listing, attachment download, read flag.
//!
//! The read flag is the only record of what has been processed, so listing
//! must never flip it; only `mark_read` does.

pub mod imap;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::MailboxError;

pub use imap::ImapMailbox;

/// Message body as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    Html(String),
}

/// A named binary attachment.
#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub name: String,
    /// Empty content is a skip condition at download time.
    #[serde(skip)]
    pub content: Vec<u8>,
}

/// A mailbox item.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Transport identity (IMAP UID).
    pub uid: u32,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub body: MessageBody,
    pub is_read: bool,
    pub attachments: Vec<Attachment>,
}

/// Mailbox operations the pipeline depends on.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Unread messages in mailbox order, optionally limited to `senders`
    /// (empty = no restriction).
    async fn list_unread(&self, senders: &[String]) -> Result<Vec<Message>, MailboxError>;

    /// Flag the message as read on the server.
    async fn mark_read(&self, message: &Message) -> Result<(), MailboxError>;

    /// Write every non-empty attachment into `dir` under its own name.
    ///
    /// Existing files with the same name are overwritten. Empty attachments
    /// are logged and skipped.
    async fn download_attachments(
        &self,
        message: &Message,
        dir: &Path,
    ) -> Result<Vec<PathBuf>, std::io::Error> {
        tokio::fs::create_dir_all(dir).await?;

        let mut saved = Vec::with_capacity(message.attachments.len());
        for (index, attachment) in message.attachments.iter().enumerate() {
            if attachment.content.is_empty() {
                warn!(
                    uid = message.uid,
                    attachment = %attachment.name,
                    "Attachment has no content, skipping"
                );
                continue;
            }
            let path = dir.join(local_file_name(&attachment.name, index));
            tokio::fs::write(&path, &attachment.content).await?;
            saved.push(path);
        }

        info!(uid = message.uid, count = saved.len(), "Attachments downloaded");
        Ok(saved)
    }
}

/// Reduce an attachment name to a bare file name safe to join to a directory.
pub fn local_file_name(name: &str, index: usize) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        format!("attachment-{}", index + 1)
    } else {
        base.to_string()
    }
}

/// Whether `sender` passes the filter.
///
/// - empty filter → everything passes
/// - `user@domain.com` → exact address match
/// - `@domain.com` or `domain.com` → domain match
///
/// Comparison is case-insensitive.
pub fn sender_matches(filter: &[String], sender: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    let sender = sender.to_lowercase();
    filter.iter().any(|entry| {
        let entry = entry.to_lowercase();
        if entry.starts_with('@') {
            sender.ends_with(&entry)
        } else if entry.contains('@') {
            sender == entry
        } else {
            sender.ends_with(&format!("@{entry}"))
        }
    })
}

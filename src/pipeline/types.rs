//! Per-stage outcomes collected by the pipeline.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::delivery::UploadReceipt;

// ── Attachment outcome ──────────────────────────────────────────────

/// Why an attachment was not delivered, without it counting as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Not a decodable image.
    NotImage,
    /// Decoded, but re-encoding to the canonical format failed.
    ConversionFailed(String),
    /// Caption could not be written and uncaptioned uploads are disabled.
    CaptionFailed(String),
}

/// Why an attachment that should have been delivered was not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailReason {
    /// Missing remote directory or a rejected transfer on a healthy session.
    Delivery(String),
}

/// What happened to one downloaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttachmentOutcome {
    Delivered {
        receipt: UploadReceipt,
        /// False when the upload went ahead without a caption.
        captioned: bool,
    },
    Skipped(SkipReason),
    Failed(FailReason),
}

impl AttachmentOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentReport {
    pub file: PathBuf,
    #[serde(flatten)]
    pub outcome: AttachmentOutcome,
}

// ── Message / run reports ───────────────────────────────────────────

/// Result of processing one message to completion.
#[derive(Debug, Clone, Serialize)]
pub struct MessageReport {
    pub uid: u32,
    pub sender: String,
    pub subject: String,
    pub caption: String,
    pub attachments: Vec<AttachmentReport>,
    /// False when the read flag could not be set; the message will come
    /// back on the next run.
    pub marked_read: bool,
}

impl MessageReport {
    pub fn delivered(&self) -> usize {
        self.attachments
            .iter()
            .filter(|a| a.outcome.is_delivered())
            .count()
    }
}

/// A message abandoned before completion. It stays unread.
#[derive(Debug, Clone, Serialize)]
pub struct AbandonedMessage {
    pub uid: u32,
    pub sender: String,
    pub error: String,
}

/// Summary of one polling cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed: Vec<MessageReport>,
    pub abandoned: Vec<AbandonedMessage>,
    /// Unread messages left untouched because shutdown was requested.
    pub deferred: usize,
}

impl RunReport {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            completed: Vec::new(),
            abandoned: Vec::new(),
            deferred: 0,
        }
    }

    pub fn messages_seen(&self) -> usize {
        self.completed.len() + self.abandoned.len()
    }

    /// Counts of (delivered, skipped, failed) attachments across completed
    /// messages.
    pub fn attachment_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for attachment in self.completed.iter().flat_map(|m| &m.attachments) {
            match attachment.outcome {
                AttachmentOutcome::Delivered { .. } => counts.0 += 1,
                AttachmentOutcome::Skipped(_) => counts.1 += 1,
                AttachmentOutcome::Failed(_) => counts.2 += 1,
            }
        }
        counts
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

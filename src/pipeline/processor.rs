//! The relay pipeline: message → caption → images → remote directory.
//!
//! Messages are handled strictly one at a time and attachments in download
//! order. A message is marked read only after each of its attachments has
//! reached an outcome. If the delivery endpoint cannot be reached, the
//! message is abandoned unread so the next cycle picks it up again.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::caption::{CaptionRules, clean_caption};
use crate::config::PipelineConfig;
use crate::delivery::DeliveryClient;
use crate::error::PipelineError;
use crate::imaging;
use crate::mailbox::{Mailbox, Message};
use crate::metadata::MetadataWriter;
use crate::pipeline::types::{
    AbandonedMessage, AttachmentOutcome, AttachmentReport, FailReason, MessageReport, RunReport,
    SkipReason,
};

/// Owns every collaborator for the duration of a run, including the one
/// delivery session.
pub struct Pipeline {
    mailbox: Arc<dyn Mailbox>,
    metadata: Arc<dyn MetadataWriter>,
    delivery: DeliveryClient,
    rules: CaptionRules,
    config: PipelineConfig,
    senders: Vec<String>,
}

impl Pipeline {
    /// Create a pipeline with the default caption rules.
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        metadata: Arc<dyn MetadataWriter>,
        delivery: DeliveryClient,
        config: PipelineConfig,
    ) -> Self {
        Self {
            mailbox,
            metadata,
            delivery,
            rules: CaptionRules::default_rules(),
            config,
            senders: Vec::new(),
        }
    }

    /// Replace the caption rules.
    pub fn with_rules(mut self, rules: CaptionRules) -> Self {
        self.rules = rules;
        self
    }

    /// Only process mail from these senders (empty = everyone).
    pub fn with_senders(mut self, senders: Vec<String>) -> Self {
        self.senders = senders;
        self
    }

    /// Unread messages awaiting processing.
    pub async fn pending_messages(&self) -> Result<Vec<Message>, PipelineError> {
        Ok(self.mailbox.list_unread(&self.senders).await?)
    }

    /// One full cycle: list unread, process each, close the delivery session.
    ///
    /// `shutdown` is checked before each message; the message in flight is
    /// always finished.
    pub async fn run_once(&mut self, shutdown: &AtomicBool) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::new();
        self.log_leftovers().await;

        let messages = self.pending_messages().await?;
        info!(count = messages.len(), "Unread messages to process");

        for (index, message) in messages.iter().enumerate() {
            if shutdown.load(Ordering::Relaxed) {
                report.deferred = messages.len() - index;
                info!(deferred = report.deferred, "Shutdown requested, stopping cycle");
                break;
            }

            match self.process_message(message).await {
                Ok(done) => report.completed.push(done),
                Err(e) => {
                    error!(
                        uid = message.uid,
                        sender = %message.sender,
                        error = %e,
                        "Message processing failed, leaving it unread"
                    );
                    report.abandoned.push(AbandonedMessage {
                        uid: message.uid,
                        sender: message.sender.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.delivery.disconnect().await;
        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Process one message end to end and mark it read.
    ///
    /// Returns `Err` only when the message must stay unread: the download
    /// failed, or the delivery endpoint is unreachable.
    pub async fn process_message(
        &mut self,
        message: &Message,
    ) -> Result<MessageReport, PipelineError> {
        info!(
            uid = message.uid,
            sender = %message.sender,
            subject = %message.subject,
            "Processing message"
        );

        let files = self
            .mailbox
            .download_attachments(message, &self.config.download_dir)
            .await
            .map_err(|source| PipelineError::Download {
                uid: message.uid,
                source,
            })?;
        debug!(uid = message.uid, files = ?files, "Downloaded files");

        let caption = clean_caption(&self.rules, &message.body);
        info!(uid = message.uid, caption = %caption, "Caption extracted");

        let mut attachments = Vec::with_capacity(files.len());
        for file in files {
            let outcome = self.process_attachment(message.uid, &file, &caption).await?;
            debug!(file = %file.display(), outcome = outcome.label(), "Attachment handled");
            attachments.push(AttachmentReport { file, outcome });
        }

        let marked_read = match self.mailbox.mark_read(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    uid = message.uid,
                    error = %e,
                    "Could not mark message read; it will be processed again"
                );
                false
            }
        };

        Ok(MessageReport {
            uid: message.uid,
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            caption,
            attachments,
            marked_read,
        })
    }

    /// Classify, convert, caption and upload one file.
    async fn process_attachment(
        &mut self,
        uid: u32,
        file: &Path,
        caption: &str,
    ) -> Result<AttachmentOutcome, PipelineError> {
        let probe = file.to_path_buf();
        let is_image = tokio::task::spawn_blocking(move || imaging::is_image(&probe))
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))?;
        if !is_image {
            info!(file = %file.display(), "Not an image, skipping");
            return Ok(AttachmentOutcome::Skipped(SkipReason::NotImage));
        }

        let source = file.to_path_buf();
        let converted = tokio::task::spawn_blocking(move || imaging::to_canonical_image(&source))
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))?;
        let image = match converted {
            Ok(path) => path,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Conversion failed, skipping");
                return Ok(AttachmentOutcome::Skipped(SkipReason::ConversionFailed(
                    e.to_string(),
                )));
            }
        };

        let captioned = match self.metadata.embed_caption(&image, caption).await {
            Ok(()) => true,
            Err(e) => {
                warn!(file = %image.display(), error = %e, "Caption not written");
                if !self.config.upload_uncaptioned {
                    return Ok(AttachmentOutcome::Skipped(SkipReason::CaptionFailed(
                        e.to_string(),
                    )));
                }
                false
            }
        };

        self.delivery
            .connect()
            .await
            .map_err(|source| PipelineError::DeliveryUnavailable { uid, source })?;

        match self.delivery.upload(&image, &self.config.remote_dir).await {
            Ok(receipt) => {
                if receipt.removed_local && image != file {
                    remove_source(file).await;
                }
                Ok(AttachmentOutcome::Delivered { receipt, captioned })
            }
            Err(e) if e.is_connection_failure() => {
                Err(PipelineError::DeliveryUnavailable { uid, source: e })
            }
            Err(e) => {
                warn!(file = %image.display(), error = %e, "Upload failed");
                Ok(AttachmentOutcome::Failed(FailReason::Delivery(e.to_string())))
            }
        }
    }

    /// Log images still sitting in the download directory from earlier runs.
    async fn log_leftovers(&self) {
        let dir = self.config.download_dir.clone();
        let found = tokio::task::spawn_blocking(move || imaging::image_files_in(&dir)).await;
        match found {
            Ok(Ok(files)) if !files.is_empty() => {
                warn!(
                    count = files.len(),
                    files = ?files,
                    "Images left in download directory"
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(error = %e, "Download directory not scanned"),
            Err(e) => debug!(error = %e, "Download directory scan task failed"),
        }
    }
}

/// Remove the pre-conversion original once its converted copy is delivered.
async fn remove_source(file: &Path) {
    if let Err(e) = tokio::fs::remove_file(file).await {
        warn!(file = %file.display(), error = %e, "Failed to remove original file");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::delivery::testing::MemoryTransport;
    use crate::error::{MailboxError, MetadataError};
    use crate::mailbox::{Attachment, MessageBody};

    #[derive(Default)]
    struct FakeMailbox {
        messages: Mutex<Vec<Message>>,
        read: Mutex<HashSet<u32>>,
        fail_mark_read: bool,
    }

    #[async_trait]
    impl Mailbox for FakeMailbox {
        async fn list_unread(&self, _senders: &[String]) -> Result<Vec<Message>, MailboxError> {
            let read = self.read.lock().unwrap();
            Ok(self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| !read.contains(&m.uid))
                .cloned()
                .collect())
        }

        async fn mark_read(&self, message: &Message) -> Result<(), MailboxError> {
            if self.fail_mark_read {
                return Err(MailboxError::MarkRead {
                    uid: message.uid,
                    reason: "server busy".into(),
                });
            }
            self.read.lock().unwrap().insert(message.uid);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeMetadata {
        fail: bool,
        written: Mutex<Vec<(PathBuf, String)>>,
    }

    #[async_trait]
    impl MetadataWriter for FakeMetadata {
        async fn embed_caption(&self, path: &Path, caption: &str) -> Result<(), MetadataError> {
            if self.fail {
                return Err(MetadataError::ToolFailed {
                    tool: "exiftool".into(),
                    code: 1,
                    stderr: "boom".into(),
                });
            }
            self.written
                .lock()
                .unwrap()
                .push((path.to_path_buf(), caption.to_string()));
            Ok(())
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_pixel(4, 4, Rgb([200, 10, 10]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn message(uid: u32, body: &str, attachments: Vec<(&str, Vec<u8>)>) -> Message {
        Message {
            uid,
            sender: "anya@press.ru".into(),
            subject: "Фото".into(),
            received_at: Utc::now(),
            body: MessageBody::Text(body.into()),
            is_read: false,
            attachments: attachments
                .into_iter()
                .map(|(name, content)| Attachment {
                    name: name.into(),
                    content,
                })
                .collect(),
        }
    }

    struct Harness {
        mailbox: Arc<FakeMailbox>,
        metadata: Arc<FakeMetadata>,
        transport: MemoryTransport,
        pipeline: Pipeline,
        _dir: tempfile::TempDir,
    }

    fn harness(mailbox: FakeMailbox, metadata: FakeMetadata, upload_uncaptioned: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Arc::new(mailbox);
        let metadata = Arc::new(metadata);
        let transport = MemoryTransport::with_dirs(&["/in"]);
        let config = PipelineConfig {
            download_dir: dir.path().join("downloads"),
            remote_dir: "/in".into(),
            upload_uncaptioned,
        };
        let pipeline = Pipeline::new(
            mailbox.clone(),
            metadata.clone(),
            DeliveryClient::new(Box::new(transport.clone()), true),
            config,
        );
        Harness {
            mailbox,
            metadata,
            transport,
            pipeline,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn delivers_converted_image_and_marks_read() {
        let mailbox = FakeMailbox::default();
        let msg = message(
            1,
            "Добрый день,\nтекст\nС уважением,\nАня",
            vec![("photo.png", png_bytes())],
        );
        let mut h = harness(mailbox, FakeMetadata::default(), true);

        let report = h.pipeline.process_message(&msg).await.unwrap();

        assert_eq!(report.caption, "текст");
        assert!(report.marked_read);
        assert_eq!(report.delivered(), 1);
        assert!(h.mailbox.read.lock().unwrap().contains(&1));

        let written = h.metadata.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].0.ends_with("photo.jpg"));
        assert_eq!(written[0].1, "текст");

        assert_eq!(h.transport.remote.lock().unwrap().puts, vec!["photo.jpg"]);
    }

    #[tokio::test]
    async fn non_image_is_skipped_without_upload() {
        let msg = message(
            2,
            "text",
            vec![("notes.txt", b"just notes".to_vec()), ("pic.png", png_bytes())],
        );
        let mut h = harness(FakeMailbox::default(), FakeMetadata::default(), true);

        let report = h.pipeline.process_message(&msg).await.unwrap();

        assert_eq!(
            report.attachments[0].outcome,
            AttachmentOutcome::Skipped(SkipReason::NotImage)
        );
        assert!(report.attachments[1].outcome.is_delivered());
        assert_eq!(h.transport.remote.lock().unwrap().puts, vec!["pic.jpg"]);
        assert!(report.marked_read);
    }

    #[tokio::test]
    async fn caption_failure_still_uploads_by_default() {
        let msg = message(3, "text", vec![("a.png", png_bytes())]);
        let metadata = FakeMetadata {
            fail: true,
            ..Default::default()
        };
        let mut h = harness(FakeMailbox::default(), metadata, true);

        let report = h.pipeline.process_message(&msg).await.unwrap();

        assert!(matches!(
            report.attachments[0].outcome,
            AttachmentOutcome::Delivered {
                captioned: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn caption_failure_skips_when_uncaptioned_disabled() {
        let msg = message(4, "text", vec![("a.png", png_bytes())]);
        let metadata = FakeMetadata {
            fail: true,
            ..Default::default()
        };
        let mut h = harness(FakeMailbox::default(), metadata, false);

        let report = h.pipeline.process_message(&msg).await.unwrap();

        assert!(matches!(
            report.attachments[0].outcome,
            AttachmentOutcome::Skipped(SkipReason::CaptionFailed(_))
        ));
        assert!(h.transport.remote.lock().unwrap().puts.is_empty());
        assert!(report.marked_read);
    }

    #[tokio::test]
    async fn unreachable_endpoint_leaves_message_unread() {
        let msg = message(5, "text", vec![("a.png", png_bytes())]);
        let mut h = harness(FakeMailbox::default(), FakeMetadata::default(), true);
        h.transport.remote.lock().unwrap().refuse_connections = true;

        let err = h.pipeline.process_message(&msg).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::DeliveryUnavailable { uid: 5, .. }
        ));
        assert!(h.mailbox.read.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_remote_directory_fails_attachment_not_message() {
        let msg = message(6, "text", vec![("a.png", png_bytes())]);
        let mut h = harness(FakeMailbox::default(), FakeMetadata::default(), true);
        h.transport.remote.lock().unwrap().directories.clear();

        let report = h.pipeline.process_message(&msg).await.unwrap();

        assert!(matches!(
            report.attachments[0].outcome,
            AttachmentOutcome::Failed(FailReason::Delivery(_))
        ));
        assert!(report.marked_read);
    }

    #[tokio::test]
    async fn mark_read_failure_is_reported_not_raised() {
        let mailbox = FakeMailbox {
            fail_mark_read: true,
            ..Default::default()
        };
        let msg = message(7, "text", vec![("a.png", png_bytes())]);
        let mut h = harness(mailbox, FakeMetadata::default(), true);

        let report = h.pipeline.process_message(&msg).await.unwrap();

        assert!(!report.marked_read);
        assert_eq!(report.delivered(), 1);
    }

    #[tokio::test]
    async fn converted_original_is_removed_after_delivery() {
        let msg = message(8, "text", vec![("a.png", png_bytes())]);
        let mut h = harness(FakeMailbox::default(), FakeMetadata::default(), true);

        h.pipeline.process_message(&msg).await.unwrap();

        let downloads = h.pipeline.config.download_dir.clone();
        assert!(!downloads.join("a.png").exists());
        assert!(!downloads.join("a.jpg").exists());
    }

    #[tokio::test]
    async fn run_once_continues_past_abandoned_message() {
        let mailbox = FakeMailbox::default();
        mailbox.messages.lock().unwrap().extend([
            message(10, "one", vec![("a.png", png_bytes())]),
            message(11, "two", vec![]),
        ]);
        let mut h = harness(mailbox, FakeMetadata::default(), true);
        h.transport.remote.lock().unwrap().refuse_connections = true;

        let report = h.pipeline.run_once(&AtomicBool::new(false)).await.unwrap();

        assert_eq!(report.abandoned.len(), 1);
        assert_eq!(report.abandoned[0].uid, 10);
        assert_eq!(report.completed.len(), 1);
        assert_eq!(report.completed[0].uid, 11);

        let read = h.mailbox.read.lock().unwrap();
        assert!(!read.contains(&10));
        assert!(read.contains(&11));
    }

    #[tokio::test]
    async fn run_once_honours_shutdown_before_first_message() {
        let mailbox = FakeMailbox::default();
        mailbox
            .messages
            .lock()
            .unwrap()
            .extend([message(1, "a", vec![]), message(2, "b", vec![])]);
        let mut h = harness(mailbox, FakeMetadata::default(), true);

        let report = h.pipeline.run_once(&AtomicBool::new(true)).await.unwrap();

        assert!(report.completed.is_empty());
        assert_eq!(report.deferred, 2);
        assert!(h.mailbox.read.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn download_failure_leaves_message_unread() {
        let msg = message(12, "text", vec![("a.png", png_bytes())]);
        let mut h = harness(FakeMailbox::default(), FakeMetadata::default(), true);
        let blocker = h._dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        h.pipeline.config.download_dir = blocker;

        let err = h.pipeline.process_message(&msg).await.unwrap_err();

        assert!(matches!(err, PipelineError::Download { uid: 12, .. }));
        assert!(h.mailbox.read.lock().unwrap().is_empty());
        assert!(h.transport.remote.lock().unwrap().puts.is_empty());
    }

    #[test]
    fn pipeline_can_move_into_a_spawned_task() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Pipeline>();
    }

    #[tokio::test]
    async fn run_once_closes_delivery_session() {
        let mailbox = FakeMailbox::default();
        mailbox
            .messages
            .lock()
            .unwrap()
            .push(message(1, "a", vec![("a.png", png_bytes())]));
        let mut h = harness(mailbox, FakeMetadata::default(), true);

        h.pipeline.run_once(&AtomicBool::new(false)).await.unwrap();

        let remote = h.transport.remote.lock().unwrap();
        assert_eq!(remote.opens, 1);
        assert_eq!(remote.closes, 1);
    }
}

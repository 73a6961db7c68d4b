//! Message processing pipeline.
//!
//! Every unread message flows through:
//! 1. `Mailbox::download_attachments()` into the local download directory
//! 2. `clean_caption()`, one caption shared by all of the message's images
//! 3. per file: classify → convert to JPEG → embed caption → upload
//! 4. `Mailbox::mark_read()`
//!
//! **The read flag is the only progress record.** A message whose delivery
//! endpoint was unreachable is left unread and retried on the next cycle.

pub mod poller;
pub mod processor;
pub mod types;

pub use poller::{log_report, run_polling, spawn_poller};
pub use processor::Pipeline;
pub use types::{
    AbandonedMessage, AttachmentOutcome, AttachmentReport, FailReason, MessageReport, RunReport,
    SkipReason,
};

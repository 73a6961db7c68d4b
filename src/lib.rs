//! Photo relay: turns photos mailed in as attachments into captioned JPEGs
//! on an FTP server.

pub mod caption;
pub mod config;
pub mod delivery;
pub mod error;
pub mod imaging;
pub mod mailbox;
pub mod metadata;
pub mod pipeline;

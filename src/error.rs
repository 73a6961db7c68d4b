//! Error types for the photo relay.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mailbox transport errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed for mailbox {mailbox}")]
    AuthenticationFailed { mailbox: String },

    #[error("Mailbox protocol error: {0}")]
    Protocol(String),

    #[error("Failed to mark message {uid} as read: {reason}")]
    MarkRead { uid: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Image classification/conversion errors.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("Failed to encode {path}: {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the external metadata tool.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Failed to start {tool}: {reason}")]
    Spawn { tool: String, reason: String },

    #[error("{tool} exited with code {code}: {stderr}")]
    ToolFailed {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },
}

/// Remote delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Connection to {host}:{port} failed: {reason}")]
    Connection {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Remote directory {0} not found")]
    DirectoryNotFound(String),

    #[error("Transfer of {file} failed: {reason}")]
    Transfer { file: String, reason: String },

    #[error("No active delivery session")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeliveryError {
    /// Whether the session itself is unusable (as opposed to a single
    /// transfer failing on a healthy session).
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionLost(_) | Self::NotConnected
        )
    }
}

/// Message-level pipeline errors (the outer backstop).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Attachment download failed for message {uid}: {source}")]
    Download {
        uid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Delivery session unavailable for message {uid}: {source}")]
    DeliveryUnavailable {
        uid: u32,
        #[source]
        source: DeliveryError,
    },

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Blocking task failed: {0}")]
    Join(String),
}

//! Remote delivery of processed images.
//!
//! `DeliveryClient` owns the session state machine
//! (disconnected → connected → directory-selected) and the upload policy.
//! The wire protocol sits behind `RemoteTransport`; `ftp::FtpTransport` is
//! the production implementation.

pub mod ftp;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::DeliveryConfig;
use crate::error::DeliveryError;

pub use ftp::FtpTransport;

/// Wire-level operations of a file transfer endpoint.
///
/// Implementations only move bytes; session state and local-file policy
/// live in `DeliveryClient`.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Open a connection and authenticate.
    async fn open(&mut self) -> Result<(), DeliveryError>;

    /// Whether an already open connection still answers.
    async fn is_alive(&mut self) -> bool;

    /// Change the working directory.
    async fn change_dir(&mut self, path: &str) -> Result<(), DeliveryError>;

    /// Store `local` as `remote_name` in the working directory, replacing
    /// any existing object. Returns the number of bytes sent.
    async fn put(&mut self, remote_name: &str, local: &Path) -> Result<u64, DeliveryError>;

    /// Terminate the connection.
    async fn close(&mut self) -> Result<(), DeliveryError>;
}

/// Delivery session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    DirectorySelected(String),
}

/// A confirmed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub remote_dir: String,
    pub remote_name: String,
    pub bytes: u64,
    /// Whether the local copy was deleted afterwards.
    pub removed_local: bool,
}

/// Stateful delivery session.
pub struct DeliveryClient {
    transport: Box<dyn RemoteTransport>,
    state: SessionState,
    remove_after_upload: bool,
}

impl DeliveryClient {
    pub fn new(transport: Box<dyn RemoteTransport>, remove_after_upload: bool) -> Self {
        Self {
            transport,
            state: SessionState::Disconnected,
            remove_after_upload,
        }
    }

    /// FTP-backed client from config.
    pub fn ftp(config: &DeliveryConfig) -> Self {
        Self::new(
            Box::new(FtpTransport::new(config)),
            config.remove_after_upload,
        )
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Establish the session. Reuses a live one.
    pub async fn connect(&mut self) -> Result<(), DeliveryError> {
        if self.state != SessionState::Disconnected {
            if self.transport.is_alive().await {
                return Ok(());
            }
            warn!("Delivery session went stale, reconnecting");
            self.state = SessionState::Disconnected;
        }

        self.transport.open().await?;
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Change the working directory. A missing directory fails this call
    /// only; the session stays connected.
    pub async fn select_directory(&mut self, remote_dir: &str) -> Result<(), DeliveryError> {
        if self.state == SessionState::Disconnected {
            return Err(DeliveryError::NotConnected);
        }

        match self.transport.change_dir(remote_dir).await {
            Ok(()) => {
                self.state = SessionState::DirectorySelected(remote_dir.to_string());
                Ok(())
            }
            Err(e) if e.is_connection_failure() => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
            Err(_) => {
                self.state = SessionState::Connected;
                Err(DeliveryError::DirectoryNotFound(remote_dir.to_string()))
            }
        }
    }

    /// Upload one file into `remote_dir` under its local base name.
    pub async fn upload(
        &mut self,
        local: &Path,
        remote_dir: &str,
    ) -> Result<UploadReceipt, DeliveryError> {
        let remote_name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DeliveryError::Transfer {
                file: local.display().to_string(),
                reason: "file name is not valid UTF-8".into(),
            })?
            .to_string();

        self.select_directory(remote_dir).await?;

        let bytes = match self.transport.put(&remote_name, local).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.is_connection_failure() {
                    self.state = SessionState::Disconnected;
                }
                return Err(e);
            }
        };
        info!(
            file = %local.display(),
            remote_dir = %remote_dir,
            bytes,
            "Uploaded"
        );

        let removed_local = if self.remove_after_upload {
            match tokio::fs::remove_file(local).await {
                Ok(()) => {
                    info!(file = %local.display(), "Local file removed");
                    true
                }
                Err(e) => {
                    warn!(file = %local.display(), error = %e, "Failed to remove local file");
                    false
                }
            }
        } else {
            false
        };

        Ok(UploadReceipt {
            remote_dir: remote_dir.to_string(),
            remote_name,
            bytes,
            removed_local,
        })
    }

    /// Upload several files. Each failure is logged and the next file is
    /// still attempted.
    pub async fn upload_batch(
        &mut self,
        files: &[PathBuf],
        remote_dir: &str,
    ) -> Vec<(PathBuf, Result<UploadReceipt, DeliveryError>)> {
        let mut results = Vec::with_capacity(files.len());
        for file in files {
            let result = self.upload(file, remote_dir).await;
            if let Err(e) = &result {
                warn!(file = %file.display(), error = %e, "Upload failed");
            }
            results.push((file.clone(), result));
        }
        results
    }

    /// Best-effort session termination.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Error while closing delivery session");
        }
        self.state = SessionState::Disconnected;
    }
}

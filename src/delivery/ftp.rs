//! FTP transport (blocking `suppaftp` stream driven from `spawn_blocking`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, info};

use super::RemoteTransport;
use crate::config::DeliveryConfig;
use crate::error::DeliveryError;

/// FTP endpoint with at most one open control connection.
pub struct FtpTransport {
    host: String,
    port: u16,
    username: String,
    password: SecretString,
    stream: Option<FtpStream>,
}

impl FtpTransport {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
            stream: None,
        }
    }

    fn connection_error(&self, reason: impl ToString) -> DeliveryError {
        DeliveryError::Connection {
            host: self.host.clone(),
            port: self.port,
            reason: reason.to_string(),
        }
    }

    /// Run a blocking operation on the open stream.
    ///
    /// The stream is moved into the blocking task and put back afterwards.
    /// If the task panics the stream is lost and the transport reads as
    /// closed.
    async fn with_stream<T, F>(&mut self, op: F) -> Result<T, DeliveryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T, DeliveryError> + Send + 'static,
    {
        let mut stream = self.stream.take().ok_or(DeliveryError::NotConnected)?;
        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await
        .map_err(|e| self.connection_error(format!("FTP task failed: {e}")))?;
        self.stream = Some(stream);
        result
    }
}

fn transfer_error(file: &str, err: FtpError) -> DeliveryError {
    match err {
        FtpError::ConnectionError(e) => DeliveryError::ConnectionLost(e.to_string()),
        other => DeliveryError::Transfer {
            file: file.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl RemoteTransport for FtpTransport {
    async fn open(&mut self) -> Result<(), DeliveryError> {
        // Old control connection: drop it without waiting on the server.
        drop(self.stream.take());

        let host = self.host.clone();
        let port = self.port;
        let username = self.username.clone();
        let password = self.password.clone();

        info!(host = %host, port, "Connecting to FTP server");
        let stream = tokio::task::spawn_blocking(move || -> Result<FtpStream, FtpError> {
            let mut stream = FtpStream::connect((host.as_str(), port))?;
            stream.login(username.as_str(), password.expose_secret())?;
            stream.transfer_type(FileType::Binary)?;
            Ok(stream)
        })
        .await
        .map_err(|e| self.connection_error(format!("FTP task failed: {e}")))?
        .map_err(|e| self.connection_error(e))?;

        info!(host = %self.host, "FTP session established");
        self.stream = Some(stream);
        Ok(())
    }

    async fn is_alive(&mut self) -> bool {
        if self.stream.is_none() {
            return false;
        }
        self.with_stream(|s| s.noop().map_err(|e| transfer_error("NOOP", e)))
            .await
            .is_ok()
    }

    async fn change_dir(&mut self, path: &str) -> Result<(), DeliveryError> {
        let target = path.to_string();
        self.with_stream(move |s| s.cwd(&target).map_err(|e| transfer_error(&target, e)))
            .await
    }

    async fn put(&mut self, remote_name: &str, local: &Path) -> Result<u64, DeliveryError> {
        let name = remote_name.to_string();
        let local: PathBuf = local.to_path_buf();
        debug!(file = %local.display(), remote = %name, "Storing file");
        self.with_stream(move |s| {
            let mut reader = std::fs::File::open(&local)?;
            s.put_file(&name, &mut reader)
                .map_err(|e| transfer_error(&name, e))
        })
        .await
    }

    async fn close(&mut self) -> Result<(), DeliveryError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || stream.quit())
            .await
            .map_err(|e| self.connection_error(format!("FTP task failed: {e}")))?
            .map_err(|e| transfer_error("QUIT", e))?;
        info!(host = %self.host, "Disconnected from FTP server");
        Ok(())
    }
}

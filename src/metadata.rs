//! Caption embedding through the external `exiftool` binary.
//!
//! The caption goes into `XMP:Description` and `IPTC:Caption-Abstract`, the
//! configured label into `XMP:Label`. The file is rewritten in place with no
//! backup copy. Arguments are handed to the process directly (no shell), and
//! IPTC is told to store UTF-8 so Cyrillic captions survive intact.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::MetadataConfig;
use crate::error::MetadataError;

/// Maximum stderr kept in an error message.
const MAX_STDERR: usize = 2 * 1024;

/// Writes descriptive metadata into an image file.
#[async_trait]
pub trait MetadataWriter: Send + Sync {
    /// Set the caption (and label) on the image at `path`, in place.
    async fn embed_caption(&self, path: &Path, caption: &str) -> Result<(), MetadataError>;
}

/// `exiftool`-backed writer.
#[derive(Debug, Clone)]
pub struct ExifTool {
    binary: PathBuf,
    label: String,
    timeout: Duration,
}

impl ExifTool {
    pub fn new(config: &MetadataConfig) -> Self {
        Self {
            binary: config.exiftool_path.clone(),
            label: config.label.clone(),
            timeout: config.timeout,
        }
    }

    fn tool_name(&self) -> String {
        self.binary.display().to_string()
    }
}

/// Build the argument list for one caption write.
pub fn exiftool_args(path: &Path, caption: &str, label: &str) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-charset".to_string(),
        "iptc=UTF8".to_string(),
        "-IPTC:CodedCharacterSet=UTF8".to_string(),
        format!("-XMP:Label={label}"),
        format!("-XMP:Description={caption}"),
        format!("-IPTC:Caption-Abstract={caption}"),
        "-overwrite_original".to_string(),
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push(path.as_os_str().to_owned());
    args
}

#[async_trait]
impl MetadataWriter for ExifTool {
    async fn embed_caption(&self, path: &Path, caption: &str) -> Result<(), MetadataError> {
        let mut command = Command::new(&self.binary);
        command
            .args(exiftool_args(path, caption, &self.label))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| MetadataError::Spawn {
            tool: self.tool_name(),
            reason: e.to_string(),
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(MetadataError::Spawn {
                    tool: self.tool_name(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(MetadataError::Timeout {
                    tool: self.tool_name(),
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MetadataError::ToolFailed {
                tool: self.tool_name(),
                code: output.status.code().unwrap_or(-1),
                stderr: truncate(stderr.trim(), MAX_STDERR),
            });
        }

        debug!(
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "exiftool finished"
        );
        info!(file = %path.display(), caption = %caption, "Caption written");
        Ok(())
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

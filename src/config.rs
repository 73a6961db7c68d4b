//! Configuration types.
//!
//! One [`RelayConfig`] is built at startup and handed out by reference.
//! Each component receives only its own sub-config, so the delivery client
//! never sees mailbox credentials and vice versa.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// IMAP mailbox settings.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Mailbox identity (primary address), used in log lines and errors.
    pub address: String,
    pub folder: String,
    /// Restrict processing to these senders. Empty means every unread message.
    pub allowed_senders: Vec<String>,
}

/// FTP delivery settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Delete the local file once the server confirms the upload.
    pub remove_after_upload: bool,
}

/// External metadata tool settings.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub exiftool_path: PathBuf,
    /// Value written to the categorical label field.
    pub label: String,
    pub timeout: Duration,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            exiftool_path: PathBuf::from("exiftool"),
            label: "Purple".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub download_dir: PathBuf,
    pub remote_dir: String,
    /// Upload an image even when writing its caption failed.
    pub upload_uncaptioned: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            remote_dir: "/".to_string(),
            upload_uncaptioned: true,
        }
    }
}

/// Whole-process configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub mailbox: MailboxConfig,
    pub delivery: DeliveryConfig,
    pub metadata: MetadataConfig,
    pub pipeline: PipelineConfig,
    /// `None` runs a single cycle and exits.
    pub poll_interval: Option<Duration>,
    pub log_dir: PathBuf,
}

impl RelayConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            get(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };

        let username = required("MAIL_USERNAME")?;
        let mailbox = MailboxConfig {
            host: required("MAIL_IMAP_HOST")?,
            port: parse_or(&get, "MAIL_IMAP_PORT", 993)?,
            password: SecretString::from(required("MAIL_PASSWORD")?),
            address: get("MAIL_ADDRESS").unwrap_or_else(|| username.clone()),
            username,
            folder: get("MAIL_FOLDER").unwrap_or_else(|| "INBOX".to_string()),
            allowed_senders: split_list(get("MAIL_ALLOWED_SENDERS").as_deref()),
        };

        let delivery = DeliveryConfig {
            host: required("FTP_HOST")?,
            port: parse_or(&get, "FTP_PORT", 21)?,
            username: get("FTP_LOGIN").unwrap_or_else(|| "anonymous".to_string()),
            password: SecretString::from(get("FTP_PASS").unwrap_or_default()),
            remove_after_upload: parse_bool_or(&get, "RELAY_REMOVE_AFTER_UPLOAD", true)?,
        };

        let metadata_defaults = MetadataConfig::default();
        let metadata = MetadataConfig {
            exiftool_path: get("EXIFTOOL_PATH")
                .map(PathBuf::from)
                .unwrap_or(metadata_defaults.exiftool_path),
            label: get("RELAY_CAPTION_LABEL").unwrap_or(metadata_defaults.label),
            timeout: Duration::from_secs(parse_or(&get, "EXIFTOOL_TIMEOUT_SECS", 60)?),
        };

        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            download_dir: get("RELAY_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(pipeline_defaults.download_dir),
            remote_dir: get("FTP_REMOTE_DIR").unwrap_or(pipeline_defaults.remote_dir),
            upload_uncaptioned: parse_bool_or(&get, "RELAY_UPLOAD_UNCAPTIONED", true)?,
        };

        let poll_interval = match get("RELAY_POLL_INTERVAL_SECS") {
            Some(raw) => Some(Duration::from_secs(parse_value("RELAY_POLL_INTERVAL_SECS", &raw)?)),
            None => None,
        };

        Ok(Self {
            mailbox,
            delivery,
            metadata,
            pipeline,
            poll_interval,
            log_dir: get("RELAY_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool_or<F>(get: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

/// Split a comma-separated list, dropping blanks.
fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use photo_relay::config::RelayConfig;
use photo_relay::delivery::DeliveryClient;
use photo_relay::mailbox::ImapMailbox;
use photo_relay::metadata::ExifTool;
use photo_relay::pipeline::{self, Pipeline};

/// Messages shown by `PHOTO_RELAY_MODE=list`.
const LIST_LIMIT: usize = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();

    let config = RelayConfig::from_env().context("invalid configuration")?;
    let _log_guard = setup_logging(&config.log_dir);

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    info!("photo-relay v{}", env!("CARGO_PKG_VERSION"));

    // Authentication failure here is fatal.
    let mailbox = ImapMailbox::connect(&config.mailbox)
        .await
        .context("mailbox login failed")?;

    if std::env::var("PHOTO_RELAY_MODE").is_ok_and(|m| m.eq_ignore_ascii_case("list")) {
        return list_messages(&mailbox).await;
    }

    let pipeline = Pipeline::new(
        Arc::new(mailbox),
        Arc::new(ExifTool::new(&config.metadata)),
        DeliveryClient::ftp(&config.delivery),
        config.pipeline.clone(),
    )
    .with_senders(config.mailbox.allowed_senders.clone());

    match config.poll_interval {
        Some(interval) => {
            let (mut handle, shutdown) = pipeline::spawn_poller(pipeline, interval);
            tokio::select! {
                result = &mut handle => result.context("poller task failed")?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, finishing current message");
                    shutdown.store(true, Ordering::Relaxed);
                    handle.await.context("poller task failed")?;
                }
            }
        }
        None => {
            let mut pipeline = pipeline;
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&shutdown);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, finishing current message");
                    flag.store(true, Ordering::Relaxed);
                }
            });

            let report = pipeline.run_once(&shutdown).await?;
            pipeline::log_report(&report);
        }
    }

    info!("photo-relay stopped");
    Ok(())
}

/// Log sender, subject and time of the newest messages, read or not.
async fn list_messages(mailbox: &ImapMailbox) -> anyhow::Result<()> {
    let messages = mailbox.list_recent(LIST_LIMIT).await?;
    info!(count = messages.len(), "Recent messages");
    for message in &messages {
        info!(
            uid = message.uid,
            sender = %message.sender,
            subject = %message.subject,
            received_at = %message.received_at,
            read = message.is_read,
            "Message"
        );
    }
    Ok(())
}

/// stderr plus a daily rolling `photo-relay.log` under `log_dir`.
///
/// Falls back to stderr only if the directory cannot be created. The
/// returned guard flushes the file writer on drop.
fn setup_logging(log_dir: &Path) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
        warn!(dir = %log_dir.display(), error = %e, "File logging disabled");
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "photo-relay.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Some(guard)
}

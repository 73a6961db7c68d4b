//! Continuous polling around `Pipeline::run_once`.
//!
//! Cancellation lives here, not in the pipeline: setting the shutdown flag
//! lets the message in flight finish and stops before the next one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::pipeline::processor::Pipeline;
use crate::pipeline::types::RunReport;

/// How often an idle poller re-checks the shutdown flag.
const SHUTDOWN_CHECK: Duration = Duration::from_millis(250);

/// Spawn the polling loop on the runtime.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_poller(pipeline: Pipeline, interval: Duration) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let mut pipeline = pipeline;
        run_polling(&mut pipeline, interval, &shutdown).await;
    });

    (handle, shutdown_flag)
}

/// Run a cycle every `interval` until `shutdown` is set.
///
/// The first cycle starts immediately. A cycle that fails to list the
/// mailbox is logged and the loop carries on.
pub async fn run_polling(pipeline: &mut Pipeline, interval: Duration, shutdown: &AtomicBool) {
    info!(interval_secs = interval.as_secs(), "Poller started");
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = wait_for(shutdown) => {}
        }

        if shutdown.load(Ordering::Relaxed) {
            info!("Poller shutting down");
            return;
        }

        match pipeline.run_once(shutdown).await {
            Ok(report) => log_report(&report),
            Err(e) => error!(error = %e, "Polling cycle failed"),
        }
    }
}

async fn wait_for(flag: &AtomicBool) {
    while !flag.load(Ordering::Relaxed) {
        tokio::time::sleep(SHUTDOWN_CHECK).await;
    }
}

/// One summary line per cycle, plus the full report as JSON at debug.
pub fn log_report(report: &RunReport) {
    let (delivered, skipped, failed) = report.attachment_counts();
    let unmarked = report.completed.iter().filter(|m| !m.marked_read).count();
    info!(
        messages = report.messages_seen(),
        abandoned = report.abandoned.len(),
        deferred = report.deferred,
        unmarked,
        delivered,
        skipped,
        failed,
        elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
        "Cycle complete"
    );

    match serde_json::to_string(report) {
        Ok(json) => debug!(report = %json, "Cycle report"),
        Err(e) => debug!(error = %e, "Cycle report not serializable"),
    }
}

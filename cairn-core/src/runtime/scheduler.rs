use std::{pin::pin, sync::Arc, time::Duration};

use chrono::{DateTime, Local, TimeZone};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::ScheduleConfig,
    index::MetadataIndex,
    scanner::{ReconcileScanner, ScanStats},
};

/// First `hour:00` strictly after `now` in `now`'s time zone. Days where the
/// hour does not exist (DST gap) are skipped.
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> DateTime<Tz> {
    let tz = now.timezone();
    let hour = hour.min(23);
    now.date_naive()
        .iter_days()
        .take(3)
        .filter_map(|day| day.and_hms_opt(hour, 0, 0))
        .filter_map(|naive| tz.from_local_datetime(&naive).earliest())
        .find(|candidate| candidate > now)
        .unwrap_or_else(|| now.clone() + chrono::Duration::days(1))
}

/// Startup scan (optional), then one scan a day at the configured hour.
/// No pass starts after `shutdown` fires; a pass already running gets
/// `grace` to finish.
pub(super) async fn run_scheduler(
    scanner: ReconcileScanner,
    schedule: ScheduleConfig,
    shutdown: CancellationToken,
    grace: Duration,
) {
    if schedule.scan_on_startup && !shutdown.is_cancelled() {
        scan(&scanner, &shutdown, "startup", grace).await;
    }

    loop {
        let now = Local::now();
        let next = next_daily_run(&now, schedule.daily_scan_hour);
        let wait = (next.clone() - now).to_std().unwrap_or(Duration::ZERO);
        info!(target: "cairn::scan", next_run = %next, "next reconciliation scheduled");

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        if shutdown.is_cancelled() {
            break;
        }
        scan(&scanner, &shutdown, "daily", grace).await;
    }
    info!("Scheduler shutting down");
}

/// Runs one pass to completion unless shutdown outlasts `grace`.
async fn scan(
    scanner: &ReconcileScanner,
    shutdown: &CancellationToken,
    trigger: &str,
    grace: Duration,
) -> Option<ScanStats> {
    let mut pass = pin!(scanner.try_scan());
    let result = tokio::select! {
        result = &mut pass => result,
        _ = shutdown.cancelled() => {
            info!(target: "cairn::scan", trigger, grace_ms = grace.as_millis() as u64, "shutdown requested; finishing reconciliation");
            match tokio::time::timeout(grace, &mut pass).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(target: "cairn::scan", trigger, "reconciliation abandoned after shutdown grace period");
                    return None;
                }
            }
        }
    };
    match result {
        Ok(stats) => stats,
        Err(err) => {
            warn!(target: "cairn::scan", trigger, error = %err, "reconciliation failed");
            None
        }
    }
}

/// Periodically returns expired upload claims to the queue.
pub(super) async fn run_housekeeper(
    index: Arc<dyn MetadataIndex>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Housekeeper shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                match index.release_expired_claims().await {
                    Ok(0) => {}
                    Ok(released) => info!(released, "released expired upload claims"),
                    Err(err) => warn!("housekeeper release_expired_claims error: {err}"),
                }
            }
        }
    }
}

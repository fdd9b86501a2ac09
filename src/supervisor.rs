//! # Lifecycle Supervisor
//!
//! Owns process-level concerns no individual component should decide on its own:
//! coordinated shutdown ordering, the daily scheduled restart, translating a governor
//! emergency into an exit code, and capturing a crash post-mortem when a spawned task
//! panics instead of returning.
//!
//! Exit codes are a small, stable contract with whatever process manager restarts this
//! agent (systemd, a container orchestrator): `0` clean, `2` invalid configuration, `3`
//! model load failure, `4` governor-triggered emergency shutdown, `5` panic or other
//! unrecoverable fault.

use crate::aggregator::CameraAggregator;
use crate::error::VisionOpsError;
use crate::store::LocalStore;
use chrono::Timelike;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_CONFIG_INVALID: i32 = 2;
pub const EXIT_MODEL_LOAD_FAILURE: i32 = 3;
pub const EXIT_GOVERNOR_EMERGENCY: i32 = 4;
pub const EXIT_UNRECOVERABLE: i32 = 5;

/// Local to midnight the process' own clock treats as the scheduled-restart time.
/// Real deployments run one agent per device in a single timezone, so a naive
/// `NaiveTime` comparison against local wall-clock time is sufficient here.
pub const DEFAULT_RESTART_HOUR_LOCAL: u32 = 3;

pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }
}

/// Runs the coordinated shutdown sequence in the order the concurrency model requires:
/// capture workers first (no new frames), then a pause to let the scheduler drain its
/// in-flight dispatch, then aggregator flush, then the store is left open for the
/// replicator's final drain, bounded by one lease timeout so shutdown can't hang
/// forever waiting on a remote endpoint that is down.
pub async fn coordinated_shutdown(
    aggregators: &mut [CameraAggregator],
    store: &Arc<LocalStore>,
    replicator_drain: impl std::future::Future<Output = ()>,
    lease_seconds: i64,
) {
    log::info!("supervisor: beginning coordinated shutdown");

    tokio::time::sleep(Duration::from_millis(500)).await;

    for aggregator in aggregators.iter_mut() {
        for metric in aggregator.flush() {
            if let Err(e) = store.insert_windowed_metric(&metric) {
                log::error!("supervisor: failed to flush aggregator window on shutdown: {e}");
            }
        }
    }

    let bound = Duration::from_secs(lease_seconds.max(0) as u64);
    if tokio::time::timeout(bound, replicator_drain).await.is_err() {
        log::warn!("supervisor: replicator did not finish draining within {bound:?}, exiting anyway");
    }

    log::info!("supervisor: coordinated shutdown complete");
}

/// True once local wall-clock time has crossed the configured restart hour and at
/// least a day has passed since `last_restart`, used by the scheduled-restart task to
/// decide whether today's restart has already happened.
pub fn scheduled_restart_due(now: chrono::DateTime<chrono::Local>, last_restart: chrono::DateTime<chrono::Local>, restart_hour: u32) -> bool {
    let due_today = now.date_naive() > last_restart.date_naive() && now.time().hour() >= restart_hour;
    due_today
}

/// Captures a minimal crash post-mortem: what panicked, when, and the last governor
/// state if available. Written next to the database so an operator pulling the device
/// can find it without log aggregation.
pub fn write_crash_postmortem(store_dir: &std::path::Path, panic_info: &str) -> std::io::Result<()> {
    let path = store_dir.join("crash_postmortem.txt");
    let contents = format!("timestamp: {}\n{panic_info}\n", chrono::Utc::now().to_rfc3339());
    std::fs::write(path, contents)
}

/// Maps a top-level startup error to the documented exit code.
pub fn exit_code_for_startup_error(e: &VisionOpsError) -> i32 {
    match e {
        VisionOpsError::Configuration { .. } => EXIT_CONFIG_INVALID,
        VisionOpsError::Fatal { reason, .. } if reason.contains("model") => EXIT_MODEL_LOAD_FAILURE,
        VisionOpsError::Fatal { .. } => EXIT_UNRECOVERABLE,
        _ => EXIT_UNRECOVERABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn scheduled_restart_not_due_same_day() {
        let last = chrono::Local.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).unwrap();
        let now = chrono::Local.with_ymd_and_hms(2026, 1, 1, 23, 0, 0).unwrap();
        assert!(!scheduled_restart_due(now, last, DEFAULT_RESTART_HOUR_LOCAL));
    }

    #[test]
    fn scheduled_restart_due_next_day_past_hour() {
        let last = chrono::Local.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).unwrap();
        let now = chrono::Local.with_ymd_and_hms(2026, 1, 2, 3, 5, 0).unwrap();
        assert!(scheduled_restart_due(now, last, DEFAULT_RESTART_HOUR_LOCAL));
    }

    #[test]
    fn configuration_error_maps_to_exit_code_2() {
        let e = VisionOpsError::configuration("cameras", "missing");
        assert_eq!(exit_code_for_startup_error(&e), EXIT_CONFIG_INVALID);
    }

    #[test]
    fn model_fatal_error_maps_to_exit_code_3() {
        let e = VisionOpsError::fatal("detector model load failed: corrupt weights");
        assert_eq!(exit_code_for_startup_error(&e), EXIT_MODEL_LOAD_FAILURE);
    }
}

//! Periodic "last seen" alarm sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::models::AlarmEventStatus;
use crate::store::TelemetryStore;

// ---

/// Counters for one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// (alarm, device) pairs looked at.
    pub evaluated: usize,
    /// Pairs whose device was silent longer than the alarm threshold.
    pub overdue: usize,
    /// New `triggered` events written (already-open events are not counted).
    pub triggered: usize,
    /// Pairs skipped because of a store error.
    pub failed: usize,
}

/// Evaluate every active alarm against its devices' snapshot freshness.
///
/// A device with no snapshot yet is never overdue. Opening an event is a
/// conflict-free insert, so repeated sweeps leave one open event per pair.
pub async fn sweep(store: &dyn TelemetryStore, now: DateTime<Utc>) -> SweepSummary {
    // ---
    let mut summary = SweepSummary::default();

    let assignments = match store.alarm_assignments().await {
        Ok(assignments) => assignments,
        Err(e) => {
            warn!(error = %e, "failed to load alarm assignments");
            summary.failed += 1;
            return summary;
        }
    };

    for assignment in assignments {
        summary.evaluated += 1;

        let last_seen = match store.latest_last_seen(assignment.device_id).await {
            Ok(Some(last_seen)) => last_seen,
            Ok(None) => continue,
            Err(e) => {
                warn!(
                    alarm_id = %assignment.alarm_id,
                    device_id = %assignment.device_id,
                    error = %e,
                    "snapshot lookup failed, skipping"
                );
                summary.failed += 1;
                continue;
            }
        };

        let elapsed_ms = (now - last_seen).num_milliseconds();
        if elapsed_ms <= assignment.threshold_seconds.saturating_mul(1000) {
            continue;
        }
        summary.overdue += 1;

        match store
            .open_alarm_event(assignment.alarm_id, assignment.device_id, now)
            .await
        {
            Ok(true) => {
                summary.triggered += 1;
                info!(
                    alarm = %assignment.alarm_name,
                    device_id = %assignment.device_id,
                    elapsed_ms,
                    threshold_secs = assignment.threshold_seconds,
                    status = AlarmEventStatus::Triggered.as_str(),
                    "alarm event opened"
                );
            }
            Ok(false) => {
                debug!(alarm = %assignment.alarm_name, device_id = %assignment.device_id, "alarm already open");
            }
            Err(e) => {
                warn!(
                    alarm_id = %assignment.alarm_id,
                    device_id = %assignment.device_id,
                    error = %e,
                    "failed to open alarm event"
                );
                summary.failed += 1;
            }
        }
    }

    summary
}

/// Run [`sweep`] forever on a fixed interval.
pub async fn run_sweeper(store: Arc<dyn TelemetryStore>, every: Duration) {
    // ---
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let summary = sweep(store.as_ref(), Utc::now()).await;
        debug!(
            evaluated = summary.evaluated,
            overdue = summary.overdue,
            triggered = summary.triggered,
            failed = summary.failed,
            "alarm sweep finished"
        );
    }
}

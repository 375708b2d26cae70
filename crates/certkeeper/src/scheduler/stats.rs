//! Scheduler run statistics

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How a scheduled run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Succeeded { renewed: usize },
    Failed { renewed: usize },
    /// Cut short by shutdown; neither a success nor a failure
    Cancelled { renewed: usize },
}

/// Cumulative scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub certificates_renewed: u64,
    pub last_run_time: Option<DateTime<Utc>>,
    #[serde(with = "duration_ms")]
    pub last_run_duration: Option<Duration>,
    pub start_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
}

impl SchedulerStats {
    pub(crate) fn record(&mut self, outcome: RunOutcome, started_at: DateTime<Utc>, elapsed: Duration) {
        self.total_runs += 1;
        self.last_run_time = Some(started_at);
        self.last_run_duration = Some(elapsed);

        let renewed = match outcome {
            RunOutcome::Succeeded { renewed } => {
                self.successful_runs += 1;
                renewed
            }
            RunOutcome::Failed { renewed } => {
                self.failed_runs += 1;
                renewed
            }
            RunOutcome::Cancelled { renewed } => renewed,
        };
        self.certificates_renewed += renewed as u64;
    }

    /// Zero the counters, keeping `start_time` and `next_run_time`
    pub(crate) fn reset(&mut self) {
        *self = SchedulerStats {
            start_time: self.start_time,
            next_run_time: self.next_run_time,
            ..SchedulerStats::default()
        };
    }
}

/// Status report for display and JSON output
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    #[serde(with = "duration_ms")]
    pub uptime: Option<Duration>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_run_time: Option<DateTime<Utc>>,
    #[serde(serialize_with = "duration_ms::serialize_required")]
    pub check_interval: Duration,
    pub stats: SchedulerStats,
}

/// Durations as integer milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn serialize_required<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcomes() {
        let mut stats = SchedulerStats::default();
        let now = Utc::now();

        stats.record(RunOutcome::Succeeded { renewed: 2 }, now, Duration::from_millis(5));
        stats.record(RunOutcome::Failed { renewed: 1 }, now, Duration::from_millis(7));
        stats.record(RunOutcome::Cancelled { renewed: 0 }, now, Duration::from_millis(1));

        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.successful_runs, 1);
        assert_eq!(stats.failed_runs, 1);
        assert_eq!(stats.certificates_renewed, 3);
        assert_eq!(stats.last_run_duration, Some(Duration::from_millis(1)));
        assert_eq!(stats.last_run_time, Some(now));
    }

    #[test]
    fn test_reset_keeps_start_time() {
        let start = Utc::now();
        let mut stats = SchedulerStats {
            start_time: Some(start),
            ..SchedulerStats::default()
        };
        stats.record(RunOutcome::Succeeded { renewed: 4 }, start, Duration::from_secs(1));

        stats.reset();

        assert_eq!(stats.total_runs, 0);
        assert_eq!(stats.certificates_renewed, 0);
        assert_eq!(stats.last_run_time, None);
        assert_eq!(stats.start_time, Some(start));
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let stats = SchedulerStats {
            last_run_duration: Some(Duration::from_millis(1500)),
            ..SchedulerStats::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["last_run_duration"], 1500);
        assert!(json["last_run_time"].is_null());
    }
}

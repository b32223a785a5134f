use chrono::{Duration, FixedOffset, NaiveDate};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::models::BookingRow;
use crate::schedule::{self, ScheduleSpec};

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub events: broadcast::Sender<ServerEvent>,
    pub push: PushConfig,
    pub attendance: AttendancePolicy,
}

/// Deployment-wide attendance rules: which zone defines "today" and how
/// long after a booking's end date attendance may still be back-filled.
#[derive(Clone, Copy, Debug)]
pub struct AttendancePolicy {
    pub zone: FixedOffset,
    pub grace_days: i64,
}

impl AttendancePolicy {
    pub fn today(&self) -> NaiveDate {
        schedule::today_in_zone(&self.zone)
    }

    /// Whether non-admin marking is still open for this schedule.
    pub fn backfill_open(&self, spec: &ScheduleSpec, today: NaiveDate) -> bool {
        today <= spec.effective_end() + Duration::days(self.grace_days)
    }
}

#[derive(Clone, Debug)]
pub struct PushConfig {
    pub public_key: String,
    pub private_key: String,
    pub subject: String,
}

impl PushConfig {
    pub fn enabled(&self) -> bool {
        !(self.public_key.trim().is_empty() || self.private_key.trim().is_empty())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ServerEvent {
    pub kind: String,
    pub booking_id: Option<String>,
    pub status: Option<String>,
    pub service_status: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub address: Option<String>,
    pub service: Option<String>,
    pub notes: Option<String>,
    pub frequency: Option<String>,
    pub date: Option<String>,
    pub worker_name: Option<String>,
    pub worker_id: Option<String>,
    pub attendance_date: Option<NaiveDate>,
    pub attendance_status: Option<String>,
}

impl ServerEvent {
    pub fn from_row(kind: &str, row: BookingRow) -> Self {
        Self {
            kind: kind.to_string(),
            booking_id: Some(row.id),
            status: Some(row.status),
            service_status: Some(row.service_status),
            customer_name: Some(row.customer_name),
            customer_phone: Some(row.customer_phone),
            address: Some(row.address),
            service: Some(row.service),
            notes: row.notes,
            frequency: Some(row.frequency),
            date: Some(row.date),
            worker_name: row.worker_name,
            worker_id: row.worker_id,
            attendance_date: None,
            attendance_status: None,
        }
    }

    pub fn with_attendance(mut self, date: NaiveDate, status: &str) -> Self {
        self.attendance_date = Some(date);
        self.attendance_status = Some(status.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Frequency;
    use std::collections::BTreeSet;

    fn policy() -> AttendancePolicy {
        AttendancePolicy {
            zone: FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap(),
            grace_days: 7,
        }
    }

    #[test]
    fn backfill_window_includes_grace_days() {
        let spec = ScheduleSpec {
            frequency: Frequency::Daily,
            weekly_days: BTreeSet::new(),
            anchor: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            start: Some(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            end: Some(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()),
        };
        let policy = policy();

        assert!(policy.backfill_open(&spec, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()));
        assert!(policy.backfill_open(&spec, NaiveDate::from_ymd_opt(2024, 1, 17).unwrap()));
        assert!(!policy.backfill_open(&spec, NaiveDate::from_ymd_opt(2024, 1, 18).unwrap()));
    }
}

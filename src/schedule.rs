//! Recurrence expansion and attendance reconciliation.
//!
//! Everything here is pure calendar arithmetic at day granularity. "Today"
//! is always passed in by the caller so the same inputs give the same output.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc};
use serde::Serialize;

use crate::error::ApiError;
use crate::models::{parse_weekly_days, AttendanceStatus, BookingRow, Frequency};

/// The temporal shape of one booking, parsed out of its stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub frequency: Frequency,
    pub weekly_days: BTreeSet<u8>,
    pub anchor: NaiveDate,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl ScheduleSpec {
    pub fn from_row(row: &BookingRow) -> Result<Self, ApiError> {
        let frequency: Frequency = row.frequency.parse().map_err(ApiError::InvalidBooking)?;

        let anchor = parse_day(&row.date).ok_or_else(|| {
            ApiError::InvalidBooking(format!("anchor date '{}' is unreadable", row.date))
        })?;

        let start = parse_optional_day(row.start_date.as_deref(), "start date")?;
        let end = parse_optional_day(row.end_date.as_deref(), "end date")?;

        Ok(Self {
            frequency,
            weekly_days: parse_weekly_days(row.weekly_days.as_deref()),
            anchor,
            start,
            end,
        })
    }

    pub fn effective_start(&self) -> NaiveDate {
        self.start.unwrap_or(self.anchor)
    }

    /// A missing end collapses the range to a one-day window, never an
    /// open-ended one.
    pub fn effective_end(&self) -> NaiveDate {
        self.end.unwrap_or_else(|| self.effective_start())
    }

    /// All calendar days on which service is expected, ascending. One-time
    /// bookings yield exactly the anchor; Weekly yields the days of the
    /// start..=end window whose weekday index (Sunday=0) is in
    /// `weekly_days`; every other frequency yields the whole window.
    pub fn expand(&self) -> Vec<NaiveDate> {
        if self.frequency == Frequency::OneTime {
            return vec![self.anchor];
        }

        let end = self.effective_end();
        let mut dates = Vec::new();
        let mut day = self.effective_start();
        while day <= end {
            let keep = match self.frequency {
                Frequency::Weekly => self
                    .weekly_days
                    .contains(&(day.weekday().num_days_from_sunday() as u8)),
                _ => true,
            };
            if keep {
                dates.push(day);
            }
            day = day + Duration::days(1);
        }
        dates
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.expand().binary_search(&date).is_ok()
    }
}

/// Stored dates are either plain days ("2024-01-05") or RFC 3339 instants
/// left behind by older imports; instants are truncated to their UTC day.
pub fn parse_day(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(day);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|instant| instant.with_timezone(&Utc).date_naive())
}

fn parse_optional_day(raw: Option<&str>, label: &str) -> Result<Option<NaiveDate>, ApiError> {
    match raw {
        Some(text) if !text.trim().is_empty() => parse_day(text)
            .map(Some)
            .ok_or_else(|| ApiError::InvalidBooking(format!("{label} '{text}' is unreadable"))),
        _ => Ok(None),
    }
}

/// The current calendar day in the configured reference zone. Attendance
/// days roll over at local midnight, not UTC midnight.
pub fn today_in_zone(zone: &FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(zone).date_naive()
}

/// One day of the merged attendance view. `synthetic` entries are inferred
/// absences that exist only in this view, never in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciledDay {
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub synthetic: bool,
}

/// Merges real records into the expanded calendar, ascending by date. An
/// expected day with a real record is emitted as-is; a past day without one
/// becomes a synthetic absence; today and future days without a record are
/// omitted, their state is not yet decided.
pub fn reconcile(
    spec: &ScheduleSpec,
    real: &BTreeMap<NaiveDate, AttendanceStatus>,
    today: NaiveDate,
) -> Vec<ReconciledDay> {
    let mut merged = Vec::new();
    for date in spec.expand() {
        if let Some(status) = real.get(&date) {
            merged.push(ReconciledDay {
                date,
                status: *status,
                synthetic: false,
            });
        } else if date < today {
            merged.push(ReconciledDay {
                date,
                status: AttendanceStatus::Absent,
                synthetic: true,
            });
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn spec(frequency: Frequency) -> ScheduleSpec {
        ScheduleSpec {
            frequency,
            weekly_days: BTreeSet::new(),
            anchor: d(2024, 1, 1),
            start: Some(d(2024, 1, 1)),
            end: Some(d(2024, 1, 7)),
        }
    }

    fn booking_row() -> BookingRow {
        BookingRow {
            id: "b1".to_string(),
            customer_id: "c1".to_string(),
            customer_name: "Rohan Mehta".to_string(),
            customer_phone: "9876500001".to_string(),
            address: "12 Lake View Road".to_string(),
            service: "Daily Housekeeping".to_string(),
            notes: None,
            frequency: "Daily".to_string(),
            weekly_days: None,
            date: "2024-01-01".to_string(),
            start_date: Some("2024-01-01".to_string()),
            end_date: Some("2024-01-07".to_string()),
            status: "approved".to_string(),
            service_status: "active".to_string(),
            worker_id: Some("w1".to_string()),
            worker_name: Some("Asha Verma".to_string()),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            updated_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn weekly_expands_to_matching_weekdays() {
        // 2024-01-01 is a Monday
        let mut weekly = spec(Frequency::Weekly);
        weekly.weekly_days = [1u8, 3, 5].into_iter().collect();
        assert_eq!(
            weekly.expand(),
            vec![d(2024, 1, 1), d(2024, 1, 3), d(2024, 1, 5)]
        );
    }

    #[test]
    fn weekly_with_no_days_expands_to_nothing() {
        assert!(spec(Frequency::Weekly).expand().is_empty());
    }

    #[test]
    fn one_time_ignores_the_window() {
        let mut one_time = spec(Frequency::OneTime);
        one_time.anchor = d(2024, 2, 10);
        one_time.start = Some(d(2024, 3, 1));
        one_time.end = Some(d(2024, 3, 31));
        assert_eq!(one_time.expand(), vec![d(2024, 2, 10)]);
    }

    #[test]
    fn daily_covers_window_inclusively() {
        let daily = spec(Frequency::Daily);
        let dates = daily.expand();
        assert_eq!(dates.len(), 7);
        assert_eq!(dates.first(), Some(&d(2024, 1, 1)));
        assert_eq!(dates.last(), Some(&d(2024, 1, 7)));

        let mut live_in = spec(Frequency::LiveIn);
        live_in.end = Some(d(2024, 1, 1));
        assert_eq!(live_in.expand(), vec![d(2024, 1, 1)]);
    }

    #[test]
    fn missing_bounds_collapse_to_one_day() {
        let mut daily = spec(Frequency::Daily);
        daily.end = None;
        assert_eq!(daily.expand(), vec![d(2024, 1, 1)]);

        daily.start = None;
        daily.anchor = d(2024, 5, 20);
        assert_eq!(daily.expand(), vec![d(2024, 5, 20)]);
    }

    #[test]
    fn membership_uses_the_expanded_set() {
        let mut weekly = spec(Frequency::Weekly);
        weekly.weekly_days = [1u8, 3, 5].into_iter().collect();
        assert!(weekly.contains(d(2024, 1, 3)));
        assert!(!weekly.contains(d(2024, 1, 2)));
        assert!(!weekly.contains(d(2024, 1, 8)));
    }

    #[test]
    fn from_row_reads_stored_shapes() {
        let mut row = booking_row();
        row.frequency = "Weekly".to_string();
        row.weekly_days = Some("1,3,5".to_string());
        row.date = "2024-01-01T10:30:00Z".to_string();

        let parsed = ScheduleSpec::from_row(&row).unwrap();
        assert_eq!(parsed.frequency, Frequency::Weekly);
        assert_eq!(parsed.anchor, d(2024, 1, 1));
        assert_eq!(parsed.weekly_days.len(), 3);
    }

    #[test]
    fn from_row_rejects_unusable_rows() {
        let mut row = booking_row();
        row.frequency = "Hourly".to_string();
        assert!(matches!(
            ScheduleSpec::from_row(&row),
            Err(ApiError::InvalidBooking(_))
        ));

        let mut row = booking_row();
        row.date = "soon".to_string();
        assert!(matches!(
            ScheduleSpec::from_row(&row),
            Err(ApiError::InvalidBooking(_))
        ));

        let mut row = booking_row();
        row.end_date = Some("next month".to_string());
        assert!(matches!(
            ScheduleSpec::from_row(&row),
            Err(ApiError::InvalidBooking(_))
        ));
    }

    #[test]
    fn unmarked_past_days_become_synthetic_absences() {
        let mut weekly = spec(Frequency::Weekly);
        weekly.weekly_days = [1u8, 3, 5].into_iter().collect();

        let merged = reconcile(&weekly, &BTreeMap::new(), d(2024, 1, 5));
        assert_eq!(
            merged,
            vec![
                ReconciledDay {
                    date: d(2024, 1, 1),
                    status: AttendanceStatus::Absent,
                    synthetic: true
                },
                ReconciledDay {
                    date: d(2024, 1, 3),
                    status: AttendanceStatus::Absent,
                    synthetic: true
                },
            ]
        );
    }

    #[test]
    fn real_records_win_over_synthesis() {
        let mut weekly = spec(Frequency::Weekly);
        weekly.weekly_days = [1u8, 3, 5].into_iter().collect();

        let mut real = BTreeMap::new();
        real.insert(d(2024, 1, 3), AttendanceStatus::Present);

        let merged = reconcile(&weekly, &real, d(2024, 1, 5));
        assert_eq!(
            merged,
            vec![
                ReconciledDay {
                    date: d(2024, 1, 1),
                    status: AttendanceStatus::Absent,
                    synthetic: true
                },
                ReconciledDay {
                    date: d(2024, 1, 3),
                    status: AttendanceStatus::Present,
                    synthetic: false
                },
            ]
        );
    }

    #[test]
    fn todays_real_record_is_emitted_without_synthesis() {
        let daily = spec(Frequency::Daily);
        let today = d(2024, 1, 4);

        let mut real = BTreeMap::new();
        real.insert(today, AttendanceStatus::Present);

        let merged = reconcile(&daily, &real, today);
        assert!(merged
            .iter()
            .any(|day| day.date == today && !day.synthetic));
        assert!(merged
            .iter()
            .all(|day| !(day.synthetic && day.date >= today)));
    }

    #[test]
    fn one_time_past_booking_reconciles_to_one_absence() {
        let mut one_time = spec(Frequency::OneTime);
        one_time.anchor = d(2024, 2, 10);
        one_time.start = None;
        one_time.end = None;

        let merged = reconcile(&one_time, &BTreeMap::new(), d(2024, 2, 15));
        assert_eq!(
            merged,
            vec![ReconciledDay {
                date: d(2024, 2, 10),
                status: AttendanceStatus::Absent,
                synthetic: true
            }]
        );
    }

    #[test]
    fn every_expanded_past_day_appears_exactly_once() {
        let daily = spec(Frequency::Daily);
        let today = d(2024, 1, 5);

        let mut real = BTreeMap::new();
        real.insert(d(2024, 1, 2), AttendanceStatus::Present);
        real.insert(d(2024, 1, 3), AttendanceStatus::Absent);

        let merged = reconcile(&daily, &real, today);
        let expected: Vec<NaiveDate> = daily
            .expand()
            .into_iter()
            .filter(|date| *date < today)
            .collect();
        let merged_dates: Vec<NaiveDate> = merged.iter().map(|day| day.date).collect();
        assert_eq!(merged_dates, expected);
    }
}

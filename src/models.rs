use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::Serialize;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_WORKER: &str = "worker";
pub const ROLE_CUSTOMER: &str = "customer";

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_APPROVED: &str = "approved";
pub const STATUS_REJECTED: &str = "rejected";
pub const STATUS_COMPLETED: &str = "completed";

pub const SERVICE_ACTIVE: &str = "active";
pub const SERVICE_ENDED: &str = "ended";

/// Recurrence rule of a booking. The string forms are the stored and wire
/// representation and must not change without a data migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    OneTime,
    Daily,
    Weekly,
    LiveIn,
    DayShift,
    PartTime,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::OneTime => "One-time",
            Frequency::Daily => "Daily",
            Frequency::Weekly => "Weekly",
            Frequency::LiveIn => "Live-in",
            Frequency::DayShift => "Day-shift",
            Frequency::PartTime => "Part-time",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "One-time" => Ok(Frequency::OneTime),
            "Daily" => Ok(Frequency::Daily),
            "Weekly" => Ok(Frequency::Weekly),
            "Live-in" => Ok(Frequency::LiveIn),
            "Day-shift" => Ok(Frequency::DayShift),
            "Part-time" => Ok(Frequency::PartTime),
            other => Err(format!("unknown frequency '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "present" => Ok(AttendanceStatus::Present),
            "absent" => Ok(AttendanceStatus::Absent),
            other => Err(format!(
                "attendance status must be present or absent, got '{other}'"
            )),
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: String,
    pub password_hash: String,
    pub active: i64,
    pub created_at: String,
}

/// A booking joined with the assigned worker's display name. Temporal fields
/// stay as stored text here; `schedule::ScheduleSpec` owns their parsing.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BookingRow {
    pub id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub address: String,
    pub service: String,
    pub notes: Option<String>,
    pub frequency: String,
    pub weekly_days: Option<String>,
    pub date: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub status: String,
    pub service_status: String,
    pub worker_id: Option<String>,
    pub worker_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AttendanceRow {
    pub id: String,
    pub booking_id: String,
    pub worker_id: String,
    pub customer_id: String,
    pub date: NaiveDate,
    pub status: String,
    pub marked_by: String,
    pub marked_by_role: String,
    pub marked_by_name: Option<String>,
    pub marked_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActivityRow {
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceOption {
    pub name: &'static str,
    pub duration: &'static str,
    pub description: &'static str,
}

pub fn service_catalog() -> Vec<ServiceOption> {
    vec![
        ServiceOption {
            name: "Deep Home Cleaning",
            duration: "3 hrs",
            description: "Full-house scrub down, kitchen and bathrooms included.",
        },
        ServiceOption {
            name: "Daily Housekeeping",
            duration: "1 hr",
            description: "Sweeping, mopping, dusting, and dishes.",
        },
        ServiceOption {
            name: "Home Cooking",
            duration: "2 hrs",
            description: "Fresh meals prepared in your kitchen.",
        },
        ServiceOption {
            name: "Elder Care",
            duration: "8 hrs",
            description: "Daytime companionship and assisted care for seniors.",
        },
        ServiceOption {
            name: "Child Care",
            duration: "8 hrs",
            description: "Experienced nanny for infants and toddlers.",
        },
        ServiceOption {
            name: "Patient Attendant",
            duration: "12 hrs",
            description: "Trained attendant for post-operative and bedridden care.",
        },
    ]
}

/// Parses the stored weekly-day set ("1,3,5"). Weekday indices run Sunday=0
/// through Saturday=6; tokens outside that range are dropped.
pub fn parse_weekly_days(raw: Option<&str>) -> BTreeSet<u8> {
    raw.unwrap_or_default()
        .split(',')
        .filter_map(|token| token.trim().parse::<u8>().ok())
        .filter(|day| *day <= 6)
        .collect()
}

pub fn weekly_days_to_csv(days: &BTreeSet<u8>) -> String {
    days.iter()
        .map(|day| day.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_round_trips_wire_strings() {
        for raw in ["One-time", "Daily", "Weekly", "Live-in", "Day-shift", "Part-time"] {
            let parsed: Frequency = raw.parse().unwrap();
            assert_eq!(parsed.as_str(), raw);
        }
        assert!("fortnightly".parse::<Frequency>().is_err());
    }

    #[test]
    fn weekly_days_parse_and_render() {
        let days = parse_weekly_days(Some("5, 1,3"));
        assert_eq!(days.into_iter().collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(parse_weekly_days(None).len(), 0);
        // out-of-range and junk tokens are dropped, duplicates collapse
        let days = parse_weekly_days(Some("9,2,x,2"));
        assert_eq!(days.into_iter().collect::<Vec<_>>(), vec![2]);

        let days: BTreeSet<u8> = [5u8, 0, 3].into_iter().collect();
        assert_eq!(weekly_days_to_csv(&days), "0,3,5");
    }

    #[test]
    fn attendance_status_parses() {
        assert_eq!(
            "present".parse::<AttendanceStatus>().unwrap(),
            AttendanceStatus::Present
        );
        assert_eq!(
            " absent ".parse::<AttendanceStatus>().unwrap(),
            AttendanceStatus::Absent
        );
        assert!("late".parse::<AttendanceStatus>().is_err());
    }
}

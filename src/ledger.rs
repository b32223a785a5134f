//! Attendance ledger: authoritative per-day records plus the shared merge
//! paths every consumer reads through. The booking's attendance log is
//! derived from these rows on read, never stored alongside them.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::{
    auth::{new_id, AuthUser},
    db,
    error::ApiError,
    models::{AttendanceRow, AttendanceStatus, BookingRow, SERVICE_ENDED},
    schedule::{reconcile, ReconciledDay, ScheduleSpec},
    state::AttendancePolicy,
};

/// Per-booking authorization: the owning customer, the assigned worker, or
/// an admin.
pub fn ensure_booking_access(booking: &BookingRow, actor: &AuthUser) -> Result<(), ApiError> {
    if actor.is_admin()
        || booking.customer_id == actor.id
        || booking.worker_id.as_deref() == Some(actor.id.as_str())
    {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Upserts the record for (booking, day). Gates, in order: actor must be
/// allowed on the booking; a worker must be assigned (admins included);
/// non-admins need the service open for marking (not ended, inside the
/// grace window); the target day must not be in the future, not precede the
/// service start, and must be one of the booking's scheduled days.
///
/// Concurrent marks for the same day race on the upsert and the last writer
/// wins; no marking request fails because of contention.
pub async fn mark_attendance(
    pool: &SqlitePool,
    policy: &AttendancePolicy,
    booking: &BookingRow,
    date: Option<NaiveDate>,
    status: AttendanceStatus,
    actor: &AuthUser,
) -> Result<AttendanceRow, ApiError> {
    ensure_booking_access(booking, actor)?;

    let Some(worker_id) = booking.worker_id.as_deref() else {
        return Err(ApiError::InvalidState(
            "no worker is assigned to this booking".to_string(),
        ));
    };

    let spec = ScheduleSpec::from_row(booking)?;
    let today = policy.today();

    if !actor.is_admin() {
        if booking.service_status == SERVICE_ENDED {
            return Err(ApiError::InvalidState("service has ended".to_string()));
        }
        if !policy.backfill_open(&spec, today) {
            return Err(ApiError::InvalidState(format!(
                "marking closed {} days after the last service date",
                policy.grace_days
            )));
        }
    }

    let date = date.unwrap_or(today);

    if date > today {
        return Err(ApiError::InvalidDate(format!("{date} is in the future")));
    }
    if date < spec.effective_start() {
        return Err(ApiError::InvalidDate(format!(
            "{date} is before the service start {}",
            spec.effective_start()
        )));
    }
    if !spec.contains(date) {
        return Err(ApiError::InvalidDate(format!(
            "{date} is not a scheduled service day for this booking"
        )));
    }

    sqlx::query(
        r#"INSERT INTO attendance (id, booking_id, worker_id, customer_id, date, status,
                marked_by, marked_by_role, marked_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(booking_id, date) DO UPDATE SET
             status = excluded.status,
             worker_id = excluded.worker_id,
             marked_by = excluded.marked_by,
             marked_by_role = excluded.marked_by_role,
             marked_at = excluded.marked_at"#,
    )
    .bind(new_id())
    .bind(&booking.id)
    .bind(worker_id)
    .bind(&booking.customer_id)
    .bind(date)
    .bind(status.as_str())
    .bind(&actor.id)
    .bind(&actor.role)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    fetch_record(pool, &booking.id, date)
        .await?
        .ok_or_else(|| ApiError::Internal("attendance row missing after upsert".to_string()))
}

pub async fn fetch_record(
    pool: &SqlitePool,
    booking_id: &str,
    date: NaiveDate,
) -> Result<Option<AttendanceRow>, sqlx::Error> {
    sqlx::query_as::<_, AttendanceRow>(
        r#"SELECT a.id, a.booking_id, a.worker_id, a.customer_id, a.date, a.status,
                  a.marked_by, a.marked_by_role, u.display_name AS marked_by_name, a.marked_at
           FROM attendance a
           LEFT JOIN users u ON a.marked_by = u.id
           WHERE a.booking_id = ? AND a.date = ?
           LIMIT 1"#,
    )
    .bind(booking_id)
    .bind(date)
    .fetch_optional(pool)
    .await
}

pub async fn list_for_booking(
    pool: &SqlitePool,
    booking_id: &str,
) -> Result<Vec<AttendanceRow>, sqlx::Error> {
    sqlx::query_as::<_, AttendanceRow>(
        r#"SELECT a.id, a.booking_id, a.worker_id, a.customer_id, a.date, a.status,
                  a.marked_by, a.marked_by_role, u.display_name AS marked_by_name, a.marked_at
           FROM attendance a
           LEFT JOIN users u ON a.marked_by = u.id
           WHERE a.booking_id = ?
           ORDER BY a.date ASC"#,
    )
    .bind(booking_id)
    .fetch_all(pool)
    .await
}

/// Keyed statuses for reconciliation. A row whose stored status no longer
/// parses is skipped with a warning rather than failing the whole view.
pub fn status_by_date(rows: &[AttendanceRow]) -> BTreeMap<NaiveDate, AttendanceStatus> {
    let mut map = BTreeMap::new();
    for row in rows {
        match row.status.parse::<AttendanceStatus>() {
            Ok(status) => {
                map.insert(row.date, status);
            }
            Err(err) => log::warn!("Skipping attendance row {}: {err}", row.id),
        }
    }
    map
}

/// The one reconciliation path. Booking detail, worker history, dashboards,
/// and CSV export all read through here so their views cannot drift.
pub async fn reconciled_for_booking(
    pool: &SqlitePool,
    booking: &BookingRow,
    today: NaiveDate,
) -> Result<Vec<ReconciledDay>, ApiError> {
    let spec = ScheduleSpec::from_row(booking)?;
    let rows = list_for_booking(pool, &booking.id).await?;
    Ok(reconcile(&spec, &status_by_date(&rows), today))
}

/// One line of the derived attendance log: the reconciled day plus marker
/// attribution for real records.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub synthetic: bool,
    pub marked_by_role: Option<String>,
    pub marked_by_name: Option<String>,
    pub marked_at: Option<String>,
}

pub fn attendance_log(
    spec: &ScheduleSpec,
    rows: &[AttendanceRow],
    today: NaiveDate,
) -> Vec<LogEntry> {
    let by_date: BTreeMap<NaiveDate, &AttendanceRow> =
        rows.iter().map(|row| (row.date, row)).collect();
    reconcile(spec, &status_by_date(rows), today)
        .into_iter()
        .map(|day| {
            let row = if day.synthetic {
                None
            } else {
                by_date.get(&day.date).copied()
            };
            LogEntry {
                date: day.date,
                status: day.status,
                synthetic: day.synthetic,
                marked_by_role: row.map(|r| r.marked_by_role.clone()),
                marked_by_name: row.and_then(|r| r.marked_by_name.clone()),
                marked_at: row.map(|r| r.marked_at.clone()),
            }
        })
        .collect()
}

pub async fn log_for_booking(
    pool: &SqlitePool,
    booking: &BookingRow,
    today: NaiveDate,
) -> Result<Vec<LogEntry>, ApiError> {
    let spec = ScheduleSpec::from_row(booking)?;
    let rows = list_for_booking(pool, &booking.id).await?;
    Ok(attendance_log(&spec, &rows, today))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub assigned_bookings: i64,
    pub present_days: i64,
    pub absent_days: i64,
    pub synthetic_absences: i64,
}

/// Aggregates the reconciled view across a worker's bookings. Bookings with
/// unusable schedules are skipped with a warning so one bad row cannot take
/// down a dashboard.
pub async fn worker_attendance_stats(
    pool: &SqlitePool,
    policy: &AttendancePolicy,
    worker_id: &str,
) -> Result<WorkerStats, ApiError> {
    let bookings = db::list_bookings_for_worker(pool, worker_id).await?;
    let today = policy.today();

    let mut stats = WorkerStats {
        assigned_bookings: bookings.len() as i64,
        ..WorkerStats::default()
    };
    for booking in &bookings {
        let merged = match reconciled_for_booking(pool, booking, today).await {
            Ok(merged) => merged,
            Err(ApiError::InvalidBooking(reason)) => {
                log::warn!("Skipping booking {} in worker stats: {reason}", booking.id);
                continue;
            }
            Err(err) => return Err(err),
        };
        for day in merged {
            match day.status {
                AttendanceStatus::Present => stats.present_days += 1,
                AttendanceStatus::Absent => {
                    stats.absent_days += 1;
                    if day.synthetic {
                        stats.synthetic_absences += 1;
                    }
                }
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::{Frequency, ROLE_ADMIN, ROLE_CUSTOMER, ROLE_WORKER};
    use crate::state::AttendancePolicy;
    use chrono::{Duration, FixedOffset};

    fn policy() -> AttendancePolicy {
        AttendancePolicy {
            zone: FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap(),
            grace_days: 7,
        }
    }

    fn actor(id: &str, role: &str) -> AuthUser {
        AuthUser {
            id: id.to_string(),
            display_name: format!("User {id}"),
            role: role.to_string(),
        }
    }

    async fn seed_user(pool: &SqlitePool, id: &str, role: &str) {
        sqlx::query(
            r#"INSERT INTO users (id, username, display_name, role, password_hash, active, created_at)
               VALUES (?, ?, ?, ?, 'x', 1, '2024-01-01T00:00:00Z')"#,
        )
        .bind(id)
        .bind(format!("user-{id}"))
        .bind(format!("User {id}"))
        .bind(role)
        .execute(pool)
        .await
        .unwrap();
    }

    #[allow(clippy::too_many_arguments)]
    async fn seed_booking(
        pool: &SqlitePool,
        id: &str,
        worker_id: Option<&str>,
        frequency: Frequency,
        weekly_days: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
        service_status: &str,
    ) {
        sqlx::query(
            r#"INSERT INTO bookings (id, customer_id, customer_name, customer_phone, address,
                    service, frequency, weekly_days, date, start_date, end_date, status,
                    service_status, worker_id, created_at, updated_at)
               VALUES (?, 'cust', 'Test Customer', '9876500001', '12 Lake View Road',
                    'Daily Housekeeping', ?, ?, ?, ?, ?, 'approved', ?, ?,
                    '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')"#,
        )
        .bind(id)
        .bind(frequency.as_str())
        .bind(weekly_days)
        .bind(start.format("%Y-%m-%d").to_string())
        .bind(start.format("%Y-%m-%d").to_string())
        .bind(end.format("%Y-%m-%d").to_string())
        .bind(service_status)
        .bind(worker_id)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn open_daily_booking(pool: &SqlitePool, id: &str) -> (BookingRow, NaiveDate) {
        let today = policy().today();
        seed_booking(
            pool,
            id,
            Some("worker"),
            Frequency::Daily,
            None,
            today - Duration::days(3),
            today + Duration::days(3),
            "active",
        )
        .await;
        let booking = db::fetch_booking(pool, id).await.unwrap().unwrap();
        (booking, today)
    }

    async fn base_fixtures(pool: &SqlitePool) {
        seed_user(pool, "admin", ROLE_ADMIN).await;
        seed_user(pool, "worker", ROLE_WORKER).await;
        seed_user(pool, "cust", ROLE_CUSTOMER).await;
        seed_user(pool, "stranger", ROLE_CUSTOMER).await;
    }

    #[tokio::test]
    async fn marking_today_and_backfilling_yesterday_work() {
        let pool = test_pool().await;
        base_fixtures(&pool).await;
        let (booking, today) = open_daily_booking(&pool, "b1").await;
        let worker = actor("worker", ROLE_WORKER);

        let record = mark_attendance(
            &pool,
            &policy(),
            &booking,
            None,
            AttendanceStatus::Present,
            &worker,
        )
        .await
        .unwrap();
        assert_eq!(record.date, today);
        assert_eq!(record.status, "present");
        assert_eq!(record.marked_by_name.as_deref(), Some("User worker"));

        let record = mark_attendance(
            &pool,
            &policy(),
            &booking,
            Some(today - Duration::days(1)),
            AttendanceStatus::Absent,
            &worker,
        )
        .await
        .unwrap();
        assert_eq!(record.status, "absent");
    }

    #[tokio::test]
    async fn remarking_a_day_keeps_one_row_and_the_last_status() {
        let pool = test_pool().await;
        base_fixtures(&pool).await;
        let (booking, today) = open_daily_booking(&pool, "b1").await;
        let worker = actor("worker", ROLE_WORKER);
        let admin = actor("admin", ROLE_ADMIN);

        for _ in 0..2 {
            mark_attendance(
                &pool,
                &policy(),
                &booking,
                Some(today),
                AttendanceStatus::Present,
                &worker,
            )
            .await
            .unwrap();
        }
        mark_attendance(
            &pool,
            &policy(),
            &booking,
            Some(today),
            AttendanceStatus::Absent,
            &admin,
        )
        .await
        .unwrap();

        let rows = list_for_booking(&pool, "b1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "absent");
        assert_eq!(rows[0].marked_by_role, ROLE_ADMIN);
    }

    #[tokio::test]
    async fn date_gates_reject_future_early_and_off_schedule_days() {
        let pool = test_pool().await;
        base_fixtures(&pool).await;
        let (booking, today) = open_daily_booking(&pool, "b1").await;
        let worker = actor("worker", ROLE_WORKER);

        let future = mark_attendance(
            &pool,
            &policy(),
            &booking,
            Some(today + Duration::days(1)),
            AttendanceStatus::Present,
            &worker,
        )
        .await;
        assert!(matches!(future, Err(ApiError::InvalidDate(_))));

        let early = mark_attendance(
            &pool,
            &policy(),
            &booking,
            Some(today - Duration::days(10)),
            AttendanceStatus::Present,
            &worker,
        )
        .await;
        assert!(matches!(early, Err(ApiError::InvalidDate(_))));

        // weekly booking with an empty day set schedules nothing
        seed_booking(
            &pool,
            "b2",
            Some("worker"),
            Frequency::Weekly,
            Some(""),
            today - Duration::days(3),
            today + Duration::days(3),
            "active",
        )
        .await;
        let weekly = db::fetch_booking(&pool, "b2").await.unwrap().unwrap();
        let off_schedule = mark_attendance(
            &pool,
            &policy(),
            &weekly,
            Some(today),
            AttendanceStatus::Present,
            &worker,
        )
        .await;
        assert!(matches!(off_schedule, Err(ApiError::InvalidDate(_))));
    }

    #[tokio::test]
    async fn unassigned_bookings_reject_everyone_including_admin() {
        let pool = test_pool().await;
        base_fixtures(&pool).await;
        let today = policy().today();
        seed_booking(
            &pool,
            "b1",
            None,
            Frequency::Daily,
            None,
            today - Duration::days(1),
            today + Duration::days(1),
            "active",
        )
        .await;
        let booking = db::fetch_booking(&pool, "b1").await.unwrap().unwrap();

        let admin = mark_attendance(
            &pool,
            &policy(),
            &booking,
            None,
            AttendanceStatus::Present,
            &actor("admin", ROLE_ADMIN),
        )
        .await;
        assert!(matches!(admin, Err(ApiError::InvalidState(_))));
    }

    #[tokio::test]
    async fn strangers_are_unauthorized() {
        let pool = test_pool().await;
        base_fixtures(&pool).await;
        let (booking, _) = open_daily_booking(&pool, "b1").await;

        let result = mark_attendance(
            &pool,
            &policy(),
            &booking,
            None,
            AttendanceStatus::Present,
            &actor("stranger", ROLE_CUSTOMER),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));

        assert!(ensure_booking_access(&booking, &actor("cust", ROLE_CUSTOMER)).is_ok());
        assert!(ensure_booking_access(&booking, &actor("worker", ROLE_WORKER)).is_ok());
        assert!(ensure_booking_access(&booking, &actor("admin", ROLE_ADMIN)).is_ok());
    }

    #[tokio::test]
    async fn ended_service_blocks_non_admins_only() {
        let pool = test_pool().await;
        base_fixtures(&pool).await;
        let today = policy().today();
        seed_booking(
            &pool,
            "b1",
            Some("worker"),
            Frequency::Daily,
            None,
            today - Duration::days(2),
            today + Duration::days(2),
            "ended",
        )
        .await;
        let booking = db::fetch_booking(&pool, "b1").await.unwrap().unwrap();

        let worker = mark_attendance(
            &pool,
            &policy(),
            &booking,
            Some(today),
            AttendanceStatus::Present,
            &actor("worker", ROLE_WORKER),
        )
        .await;
        assert!(matches!(worker, Err(ApiError::InvalidState(_))));

        let admin = mark_attendance(
            &pool,
            &policy(),
            &booking,
            Some(today),
            AttendanceStatus::Present,
            &actor("admin", ROLE_ADMIN),
        )
        .await;
        assert!(admin.is_ok());
    }

    #[tokio::test]
    async fn grace_window_closes_backfill_for_non_admins() {
        let pool = test_pool().await;
        base_fixtures(&pool).await;
        let today = policy().today();
        let end = today - Duration::days(10);
        seed_booking(
            &pool,
            "b1",
            Some("worker"),
            Frequency::Daily,
            None,
            end - Duration::days(2),
            end,
            "active",
        )
        .await;
        let booking = db::fetch_booking(&pool, "b1").await.unwrap().unwrap();

        let worker = mark_attendance(
            &pool,
            &policy(),
            &booking,
            Some(end),
            AttendanceStatus::Present,
            &actor("worker", ROLE_WORKER),
        )
        .await;
        assert!(matches!(worker, Err(ApiError::InvalidState(_))));

        let admin = mark_attendance(
            &pool,
            &policy(),
            &booking,
            Some(end),
            AttendanceStatus::Present,
            &actor("admin", ROLE_ADMIN),
        )
        .await;
        assert!(admin.is_ok());
    }

    #[tokio::test]
    async fn derived_log_carries_attribution_for_real_rows_only() {
        let pool = test_pool().await;
        base_fixtures(&pool).await;
        let (booking, today) = open_daily_booking(&pool, "b1").await;

        mark_attendance(
            &pool,
            &policy(),
            &booking,
            Some(today - Duration::days(1)),
            AttendanceStatus::Present,
            &actor("worker", ROLE_WORKER),
        )
        .await
        .unwrap();

        let log = log_for_booking(&pool, &booking, today).await.unwrap();
        // window opened 3 days back: two synthetic absences plus the real mark
        assert_eq!(log.len(), 3);
        let real: Vec<_> = log.iter().filter(|entry| !entry.synthetic).collect();
        assert_eq!(real.len(), 1);
        assert_eq!(real[0].marked_by_role.as_deref(), Some(ROLE_WORKER));
        assert_eq!(real[0].marked_by_name.as_deref(), Some("User worker"));
        assert!(log
            .iter()
            .filter(|entry| entry.synthetic)
            .all(|entry| entry.marked_at.is_none()));
    }

    #[tokio::test]
    async fn worker_stats_fold_reconciled_days() {
        let pool = test_pool().await;
        base_fixtures(&pool).await;
        let (booking, today) = open_daily_booking(&pool, "b1").await;

        mark_attendance(
            &pool,
            &policy(),
            &booking,
            Some(today - Duration::days(1)),
            AttendanceStatus::Present,
            &actor("worker", ROLE_WORKER),
        )
        .await
        .unwrap();

        let stats = worker_attendance_stats(&pool, &policy(), "worker")
            .await
            .unwrap();
        assert_eq!(stats.assigned_bookings, 1);
        assert_eq!(stats.present_days, 1);
        assert_eq!(stats.absent_days, 2);
        assert_eq!(stats.synthetic_absences, 2);
    }
}

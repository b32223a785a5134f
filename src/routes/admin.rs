use std::collections::BTreeSet;

use actix_web::{http::header, web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    auth::{admin_validator, hash_password, new_id, AuthUser},
    db::{self, log_activity},
    error::ApiError,
    ledger,
    models::{
        parse_weekly_days, weekly_days_to_csv, ActivityRow, BookingRow, Frequency, UserRow,
        ROLE_WORKER, SERVICE_ACTIVE, SERVICE_ENDED, STATUS_APPROVED, STATUS_COMPLETED,
        STATUS_PENDING, STATUS_REJECTED,
    },
    push,
    schedule::{parse_day, ScheduleSpec},
    state::{AppState, ServerEvent},
};

#[derive(Debug, Serialize)]
struct StatCard {
    label: String,
    value: i64,
}

#[derive(Debug, Serialize)]
struct BookingView {
    id: String,
    customer_id: String,
    customer_name: String,
    customer_phone: String,
    address: String,
    service: String,
    notes: Option<String>,
    frequency: String,
    weekly_days: Vec<u8>,
    date: String,
    start_date: Option<String>,
    end_date: Option<String>,
    status: String,
    service_status: String,
    worker_id: Option<String>,
    worker_name: Option<String>,
    created_at: String,
    updated_at: String,
}

fn to_view(row: &BookingRow) -> BookingView {
    BookingView {
        id: row.id.clone(),
        customer_id: row.customer_id.clone(),
        customer_name: row.customer_name.clone(),
        customer_phone: row.customer_phone.clone(),
        address: row.address.clone(),
        service: row.service.clone(),
        notes: row.notes.clone(),
        frequency: row.frequency.clone(),
        weekly_days: parse_weekly_days(row.weekly_days.as_deref())
            .into_iter()
            .collect(),
        date: row.date.clone(),
        start_date: row.start_date.clone(),
        end_date: row.end_date.clone(),
        status: row.status.clone(),
        service_status: row.service_status.clone(),
        worker_id: row.worker_id.clone(),
        worker_name: row.worker_name.clone(),
        created_at: row.created_at.clone(),
        updated_at: row.updated_at.clone(),
    }
}

#[derive(Debug, Serialize)]
struct ActivityView {
    message: String,
    created_at: String,
}

#[derive(Debug, Serialize)]
struct WorkerView {
    id: String,
    username: String,
    display_name: String,
    active: bool,
}

fn worker_view(user: &UserRow) -> WorkerView {
    WorkerView {
        id: user.id.clone(),
        username: user.username.clone(),
        display_name: user.display_name.clone(),
        active: user.active == 1,
    }
}

#[derive(Deserialize)]
struct BookingFilter {
    status: Option<String>,
}

/// Partial update; absent fields keep their current value. Empty strings
/// clear `worker_id`, `start_date`, `end_date`, and `notes`.
#[derive(Deserialize)]
struct BookingUpdateInput {
    status: Option<String>,
    service_status: Option<String>,
    worker_id: Option<String>,
    frequency: Option<String>,
    weekly_days: Option<Vec<u8>>,
    date: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    notes: Option<String>,
}

#[derive(Deserialize)]
struct WorkerCreateInput {
    username: Option<String>,
    display_name: Option<String>,
    password: Option<String>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .wrap(HttpAuthentication::basic(admin_validator))
            .service(web::resource("/dashboard").route(web::get().to(dashboard)))
            .service(web::resource("/bookings").route(web::get().to(list_bookings)))
            .service(
                web::resource("/bookings/{id}")
                    .route(web::get().to(booking_detail))
                    .route(web::post().to(update_booking))
                    .route(web::delete().to(delete_booking)),
            )
            .service(
                web::resource("/bookings/{id}/attendance.csv")
                    .route(web::get().to(attendance_csv)),
            )
            .service(
                web::resource("/workers")
                    .route(web::get().to(list_workers))
                    .route(web::post().to(create_worker)),
            )
            .service(web::resource("/workers/{id}").route(web::get().to(worker_profile))),
    );
}

async fn dashboard(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let total = count("SELECT COUNT(*) FROM bookings", &state).run().await;
    let pending = count(
        "SELECT COUNT(*) FROM bookings WHERE status = 'pending'",
        &state,
    )
    .run()
    .await;
    let active = count(
        "SELECT COUNT(*) FROM bookings WHERE service_status = 'active'",
        &state,
    )
    .run()
    .await;

    let today = state.attendance.today();
    let today_param = today.format("%Y-%m-%d").to_string();
    let present_today = count(
        "SELECT COUNT(*) FROM attendance WHERE date = ? AND status = 'present'",
        &state,
    )
    .run_with_param(&today_param)
    .await;
    let absent_today = count(
        "SELECT COUNT(*) FROM attendance WHERE date = ? AND status = 'absent'",
        &state,
    )
    .run_with_param(&today_param)
    .await;

    // schedules live in the rows, so "due today" is counted in memory
    let bookings = db::list_bookings_admin(&state.db, None).await?;
    let mut expected_today = 0i64;
    for booking in &bookings {
        if let Ok(spec) = ScheduleSpec::from_row(booking) {
            if spec.contains(today) {
                expected_today += 1;
            }
        }
    }

    let stats = vec![
        StatCard {
            label: "Total bookings".to_string(),
            value: total,
        },
        StatCard {
            label: "Pending review".to_string(),
            value: pending,
        },
        StatCard {
            label: "Active services".to_string(),
            value: active,
        },
        StatCard {
            label: "Expected today".to_string(),
            value: expected_today,
        },
        StatCard {
            label: "Present today".to_string(),
            value: present_today,
        },
        StatCard {
            label: "Absent today".to_string(),
            value: absent_today,
        },
    ];

    let activity_rows = sqlx::query_as::<_, ActivityRow>(
        "SELECT message, created_at FROM activities ORDER BY created_at DESC LIMIT 10",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let activities: Vec<ActivityView> = activity_rows
        .into_iter()
        .map(|row| ActivityView {
            message: row.message,
            created_at: row.created_at,
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "admin_name": auth.display_name.clone(),
        "stats": stats,
        "activities": activities,
    })))
}

async fn list_bookings(
    state: web::Data<AppState>,
    query: web::Query<BookingFilter>,
) -> Result<HttpResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::trim)
        .filter(|status| !status.is_empty());
    let rows = db::list_bookings_admin(&state.db, status).await?;
    let bookings: Vec<BookingView> = rows.iter().map(to_view).collect();
    Ok(HttpResponse::Ok().json(bookings))
}

async fn booking_detail(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let booking_id = path.into_inner();
    let booking = db::fetch_booking(&state.db, &booking_id)
        .await?
        .ok_or(ApiError::NotFound("booking"))?;

    let spec = ScheduleSpec::from_row(&booking)?;
    let today = state.attendance.today();
    let rows = ledger::list_for_booking(&state.db, &booking.id).await?;
    let log = ledger::attendance_log(&spec, &rows, today);
    let next_service_date = spec.expand().into_iter().find(|date| *date >= today);

    Ok(HttpResponse::Ok().json(json!({
        "booking": to_view(&booking),
        "attendance_log": log,
        "next_service_date": next_service_date,
    })))
}

async fn update_booking(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<BookingUpdateInput>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let booking_id = path.into_inner();
    let input = payload.into_inner();
    let current = db::fetch_booking(&state.db, &booking_id)
        .await?
        .ok_or(ApiError::NotFound("booking"))?;

    let mut errors = Vec::new();

    let status = match input.status.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => {
            let allowed = [
                STATUS_PENDING,
                STATUS_APPROVED,
                STATUS_REJECTED,
                STATUS_COMPLETED,
            ];
            if !allowed.contains(&value) {
                errors.push(format!("Unknown status '{value}'."));
            }
            value.to_string()
        }
        _ => current.status.clone(),
    };

    let service_status = match input.service_status.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => {
            if ![SERVICE_ACTIVE, SERVICE_ENDED].contains(&value) {
                errors.push(format!("Unknown service status '{value}'."));
            }
            value.to_string()
        }
        _ => current.service_status.clone(),
    };

    let worker_id = match input.worker_id.as_deref().map(str::trim) {
        None => current.worker_id.clone(),
        Some("") => None,
        Some(id) => match db::fetch_user(&state.db, id).await? {
            Some(user) if user.role == ROLE_WORKER && user.active == 1 => Some(user.id),
            Some(_) => {
                errors.push("Assignee must be an active worker.".to_string());
                current.worker_id.clone()
            }
            None => return Err(ApiError::NotFound("worker")),
        },
    };

    let frequency = match input.frequency.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => match raw.parse::<Frequency>() {
            Ok(frequency) => frequency.as_str().to_string(),
            Err(err) => {
                errors.push(err);
                current.frequency.clone()
            }
        },
        _ => current.frequency.clone(),
    };

    let weekly_days = match input.weekly_days {
        Some(days) => {
            let set: BTreeSet<u8> = days.into_iter().collect();
            if set.iter().any(|day| *day > 6) {
                errors.push("Weekday indices run 0 (Sunday) through 6 (Saturday).".to_string());
            }
            if set.is_empty() {
                None
            } else {
                Some(weekly_days_to_csv(&set))
            }
        }
        None => current.weekly_days.clone(),
    };

    let date = match input.date.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => match parse_day(raw) {
            Some(day) => day.format("%Y-%m-%d").to_string(),
            None => {
                errors.push(format!("Unreadable service date '{raw}'."));
                current.date.clone()
            }
        },
        _ => current.date.clone(),
    };

    // an edited anchor pulls the window start along unless one is given
    let start_date = match input.start_date.as_deref().map(str::trim) {
        Some("") => None,
        Some(raw) => match parse_day(raw) {
            Some(day) => Some(day.format("%Y-%m-%d").to_string()),
            None => {
                errors.push(format!("Unreadable start date '{raw}'."));
                current.start_date.clone()
            }
        },
        None if input.date.is_some() => Some(date.clone()),
        None => current.start_date.clone(),
    };

    let end_date = match input.end_date.as_deref().map(str::trim) {
        Some("") => None,
        Some(raw) => match parse_day(raw) {
            Some(day) => Some(day.format("%Y-%m-%d").to_string()),
            None => {
                errors.push(format!("Unreadable end date '{raw}'."));
                current.end_date.clone()
            }
        },
        None => current.end_date.clone(),
    };

    if let (Some(start), Some(end)) = (
        start_date.as_deref().and_then(parse_day),
        end_date.as_deref().and_then(parse_day),
    ) {
        if end < start {
            errors.push("End date precedes the start date.".to_string());
        }
    }

    let notes = match input.notes.as_deref().map(str::trim) {
        Some("") => None,
        Some(value) => Some(value.to_string()),
        None => current.notes.clone(),
    };

    if !errors.is_empty() {
        return Ok(HttpResponse::UnprocessableEntity().json(json!({ "errors": errors })));
    }

    sqlx::query(
        r#"UPDATE bookings
           SET status = ?, service_status = ?, worker_id = ?, frequency = ?, weekly_days = ?,
               date = ?, start_date = ?, end_date = ?, notes = ?, updated_at = ?
           WHERE id = ?"#,
    )
    .bind(&status)
    .bind(&service_status)
    .bind(&worker_id)
    .bind(&frequency)
    .bind(&weekly_days)
    .bind(&date)
    .bind(&start_date)
    .bind(&end_date)
    .bind(&notes)
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(&booking_id)
    .execute(&state.db)
    .await?;

    log_activity(
        &state.db,
        "booking_updated",
        &format!("{} updated booking {}.", auth.display_name, booking_id),
        Some(&auth.id),
        Some(&booking_id),
    )
    .await;

    let booking_url = format!("/bookings/{booking_id}");
    let note_body = format!("Status changed to {status}.");
    push::notify_booking(
        &state,
        &booking_id,
        push::Notification {
            title: "Booking updated",
            body: &note_body,
            url: &booking_url,
        },
    )
    .await;

    let Some(updated) = db::fetch_booking(&state.db, &booking_id).await? else {
        return Err(ApiError::Internal("booking missing after update".to_string()));
    };
    let view = to_view(&updated);
    let _ = state
        .events
        .send(ServerEvent::from_row("booking_updated", updated));

    Ok(HttpResponse::Ok().json(view))
}

async fn delete_booking(
    state: web::Data<AppState>,
    path: web::Path<String>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let booking_id = path.into_inner();
    let booking = db::fetch_booking(&state.db, &booking_id)
        .await?
        .ok_or(ApiError::NotFound("booking"))?;

    if !db::delete_booking_cascade(&state.db, &booking_id).await? {
        return Err(ApiError::NotFound("booking"));
    }

    log_activity(
        &state.db,
        "booking_deleted",
        &format!(
            "{} deleted the {} booking for {}.",
            auth.display_name, booking.service, booking.customer_name
        ),
        Some(&auth.id),
        Some(&booking_id),
    )
    .await;

    let _ = state
        .events
        .send(ServerEvent::from_row("booking_deleted", booking));

    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}

/// Reporting adapter: the derived attendance log as CSV, oldest day first.
async fn attendance_csv(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let booking_id = path.into_inner();
    let booking = db::fetch_booking(&state.db, &booking_id)
        .await?
        .ok_or(ApiError::NotFound("booking"))?;

    let today = state.attendance.today();
    let log = ledger::log_for_booking(&state.db, &booking, today).await?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "date",
            "status",
            "synthetic",
            "marked_by_role",
            "marked_by",
            "marked_at",
        ])
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    for entry in &log {
        writer
            .write_record([
                entry.date.format("%Y-%m-%d").to_string(),
                entry.status.as_str().to_string(),
                entry.synthetic.to_string(),
                entry.marked_by_role.clone().unwrap_or_default(),
                entry.marked_by_name.clone().unwrap_or_default(),
                entry.marked_at.clone().unwrap_or_default(),
            ])
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/csv; charset=utf-8"))
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"attendance-{booking_id}.csv\""),
        ))
        .body(bytes))
}

async fn list_workers(state: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let rows = sqlx::query_as::<_, UserRow>(
        r#"SELECT id, username, display_name, role, password_hash, active, created_at
           FROM users WHERE role = ? ORDER BY display_name"#,
    )
    .bind(ROLE_WORKER)
    .fetch_all(&state.db)
    .await?;
    let workers: Vec<WorkerView> = rows.iter().map(worker_view).collect();
    Ok(HttpResponse::Ok().json(workers))
}

async fn create_worker(
    state: web::Data<AppState>,
    payload: web::Json<WorkerCreateInput>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let input = payload.into_inner();
    let mut errors = Vec::new();

    let username = input.username.unwrap_or_default().trim().to_string();
    if username.is_empty() {
        errors.push("Username is required.".to_string());
    }
    let display_name = input.display_name.unwrap_or_default().trim().to_string();
    if display_name.is_empty() {
        errors.push("Display name is required.".to_string());
    }
    let password = input.password.unwrap_or_default();
    if password.trim().len() < 6 {
        errors.push("Password must be at least 6 characters.".to_string());
    }

    if !errors.is_empty() {
        return Ok(HttpResponse::UnprocessableEntity().json(json!({ "errors": errors })));
    }

    let password_hash =
        hash_password(&password).map_err(|_| ApiError::Internal("hash failure".to_string()))?;
    let worker_id = new_id();

    let result = sqlx::query(
        r#"INSERT INTO users (id, username, display_name, role, password_hash, active, created_at)
           VALUES (?, ?, ?, ?, ?, 1, ?)"#,
    )
    .bind(&worker_id)
    .bind(&username)
    .bind(&display_name)
    .bind(ROLE_WORKER)
    .bind(password_hash)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(&state.db)
    .await;

    if let Err(err) = result {
        return Ok(HttpResponse::UnprocessableEntity()
            .json(json!({ "errors": [format!("Failed to create worker: {err}")] })));
    }

    log_activity(
        &state.db,
        "worker_created",
        &format!("{} created worker profile {display_name}.", auth.display_name),
        Some(&auth.id),
        None,
    )
    .await;

    let Some(user) = db::fetch_user(&state.db, &worker_id).await? else {
        return Err(ApiError::Internal("worker missing after insert".to_string()));
    };
    Ok(HttpResponse::Created().json(worker_view(&user)))
}

async fn worker_profile(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let worker_id = path.into_inner();
    let user = db::fetch_user(&state.db, &worker_id)
        .await?
        .filter(|user| user.role == ROLE_WORKER)
        .ok_or(ApiError::NotFound("worker"))?;

    let stats = ledger::worker_attendance_stats(&state.db, &state.attendance, &user.id).await?;

    let mut rows = db::list_bookings_for_worker(&state.db, &user.id).await?;
    rows.truncate(8);
    let bookings: Vec<BookingView> = rows.iter().map(to_view).collect();

    Ok(HttpResponse::Ok().json(json!({
        "worker": worker_view(&user),
        "stats": stats,
        "bookings": bookings,
    })))
}

fn count(query: &str, state: &web::Data<AppState>) -> CountQuery {
    CountQuery {
        query: query.to_string(),
        state: state.clone(),
    }
}

struct CountQuery {
    query: String,
    state: web::Data<AppState>,
}

impl CountQuery {
    async fn run(self) -> i64 {
        sqlx::query_scalar::<_, i64>(&self.query)
            .fetch_one(&self.state.db)
            .await
            .unwrap_or(0)
    }

    async fn run_with_param(self, param: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&self.query)
            .bind(param)
            .fetch_one(&self.state.db)
            .await
            .unwrap_or(0)
    }
}

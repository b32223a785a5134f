use actix_web::{web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::json;

use crate::{
    auth::{worker_validator, AuthUser},
    db,
    error::ApiError,
    ledger,
    models::{parse_weekly_days, AttendanceStatus, BookingRow},
    schedule::ScheduleSpec,
    state::AppState,
};

#[derive(Debug, Serialize)]
struct StatCard {
    label: String,
    value: i64,
}

#[derive(Debug, Serialize)]
struct AssignmentView {
    id: String,
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
}

fn to_view(row: &BookingRow) -> AssignmentView {
    AssignmentView {
        id: row.id.clone(),
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
    }
}

#[derive(Debug, Serialize)]
struct HistoryEntry {
    booking_id: String,
    customer_name: String,
    service: String,
    date: NaiveDate,
    status: AttendanceStatus,
    synthetic: bool,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/worker")
            .wrap(HttpAuthentication::basic(worker_validator))
            .service(web::resource("/dashboard").route(web::get().to(dashboard)))
            .service(web::resource("/bookings").route(web::get().to(list_bookings)))
            .service(web::resource("/attendance").route(web::get().to(attendance_history))),
    );
}

async fn dashboard(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let stats = ledger::worker_attendance_stats(&state.db, &state.attendance, &auth.id).await?;

    let today = state.attendance.today();
    let bookings = db::list_bookings_for_worker(&state.db, &auth.id).await?;
    let mut due_today = Vec::new();
    for booking in &bookings {
        match ScheduleSpec::from_row(booking) {
            Ok(spec) if spec.contains(today) => due_today.push(to_view(booking)),
            Ok(_) => {}
            Err(err) => {
                log::warn!("Skipping booking {} on the worker dashboard: {err}", booking.id)
            }
        }
    }

    let cards = vec![
        StatCard {
            label: "Assigned bookings".to_string(),
            value: stats.assigned_bookings,
        },
        StatCard {
            label: "Present days".to_string(),
            value: stats.present_days,
        },
        StatCard {
            label: "Absent days".to_string(),
            value: stats.absent_days,
        },
        StatCard {
            label: "Unmarked past days".to_string(),
            value: stats.synthetic_absences,
        },
    ];

    Ok(HttpResponse::Ok().json(json!({
        "worker_name": auth.display_name.clone(),
        "stats": cards,
        "due_today": due_today,
    })))
}

async fn list_bookings(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let rows = db::list_bookings_for_worker(&state.db, &auth.id).await?;
    let bookings: Vec<AssignmentView> = rows.iter().map(to_view).collect();
    Ok(HttpResponse::Ok().json(bookings))
}

/// Reconciled history across every assigned booking, newest day first. A
/// booking with an unusable schedule is skipped so the rest still renders.
async fn attendance_history(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let bookings = db::list_bookings_for_worker(&state.db, &auth.id).await?;
    let today = state.attendance.today();

    let mut entries = Vec::new();
    for booking in &bookings {
        let merged = match ledger::reconciled_for_booking(&state.db, booking, today).await {
            Ok(merged) => merged,
            Err(ApiError::InvalidBooking(reason)) => {
                log::warn!("Skipping booking {} in worker history: {reason}", booking.id);
                continue;
            }
            Err(err) => return Err(err),
        };
        for day in merged {
            entries.push(HistoryEntry {
                booking_id: booking.id.clone(),
                customer_name: booking.customer_name.clone(),
                service: booking.service.clone(),
                date: day.date,
                status: day.status,
                synthetic: day.synthetic,
            });
        }
    }
    entries.sort_by(|a, b| b.date.cmp(&a.date));

    Ok(HttpResponse::Ok().json(entries))
}

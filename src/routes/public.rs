use std::collections::BTreeSet;

use actix_web::{web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    auth::{basic_validator, new_id, AuthUser},
    db::{self, log_activity},
    error::ApiError,
    ledger,
    models::{
        parse_weekly_days, service_catalog, weekly_days_to_csv, AttendanceStatus, BookingRow,
        Frequency, SERVICE_ACTIVE, STATUS_PENDING,
    },
    push,
    schedule::{parse_day, ScheduleSpec},
    state::{AppState, ServerEvent},
};

#[derive(Debug, Serialize)]
struct BookingView {
    id: String,
    service: String,
    notes: Option<String>,
    frequency: String,
    weekly_days: Vec<u8>,
    date: String,
    start_date: Option<String>,
    end_date: Option<String>,
    status: String,
    service_status: String,
    customer_name: String,
    customer_phone: String,
    address: String,
    worker_name: Option<String>,
    created_at: String,
    updated_at: String,
}

fn to_view(row: &BookingRow) -> BookingView {
    BookingView {
        id: row.id.clone(),
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
        customer_name: row.customer_name.clone(),
        customer_phone: row.customer_phone.clone(),
        address: row.address.clone(),
        worker_name: row.worker_name.clone(),
        created_at: row.created_at.clone(),
        updated_at: row.updated_at.clone(),
    }
}

#[derive(Deserialize)]
struct CreateBookingInput {
    customer_name: Option<String>,
    customer_phone: Option<String>,
    address: Option<String>,
    service: Option<String>,
    notes: Option<String>,
    frequency: Option<String>,
    weekly_days: Option<Vec<u8>>,
    date: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    push_subscription: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    order: Option<String>,
}

#[derive(Deserialize)]
struct MarkInput {
    date: Option<String>,
    status: Option<String>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/services").route(web::get().to(services)))
        .service(
            web::resource("/bookings/{id}/subscribe").route(web::post().to(subscribe_notifications)),
        )
        .service(
            web::resource("/bookings")
                .wrap(HttpAuthentication::basic(basic_validator))
                .route(web::get().to(my_bookings))
                .route(web::post().to(create_booking)),
        )
        .service(
            web::resource("/bookings/{id}")
                .wrap(HttpAuthentication::basic(basic_validator))
                .route(web::get().to(booking_detail)),
        )
        .service(
            web::resource("/bookings/{id}/valid-dates")
                .wrap(HttpAuthentication::basic(basic_validator))
                .route(web::get().to(valid_dates)),
        )
        .service(
            web::resource("/bookings/{id}/attendance")
                .wrap(HttpAuthentication::basic(basic_validator))
                .route(web::get().to(attendance_history))
                .route(web::post().to(mark_attendance))
                .route(web::put().to(mark_attendance)),
        );
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

async fn services() -> HttpResponse {
    HttpResponse::Ok().json(service_catalog())
}

async fn my_bookings(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse, ApiError> {
    let rows = db::list_bookings_for_customer(&state.db, &auth.id).await?;
    let bookings: Vec<BookingView> = rows.iter().map(to_view).collect();
    Ok(HttpResponse::Ok().json(bookings))
}

async fn create_booking(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    payload: web::Json<CreateBookingInput>,
) -> Result<HttpResponse, ApiError> {
    let input = payload.into_inner();
    let mut errors = Vec::new();

    let customer_name = input.customer_name.unwrap_or_default().trim().to_string();
    let customer_name = if customer_name.is_empty() {
        auth.display_name.clone()
    } else {
        customer_name
    };

    let customer_phone = input.customer_phone.unwrap_or_default().trim().to_string();
    if customer_phone.is_empty() {
        errors.push("Phone number is required.".to_string());
    }

    let address = input.address.unwrap_or_default().trim().to_string();
    if address.is_empty() {
        errors.push("Service address is required.".to_string());
    }

    let service = input.service.unwrap_or_default().trim().to_string();
    if !service_catalog().iter().any(|option| option.name == service) {
        errors.push("Please pick a service from the catalog.".to_string());
    }

    let frequency = match input.frequency.unwrap_or_default().parse::<Frequency>() {
        Ok(frequency) => Some(frequency),
        Err(err) => {
            errors.push(err);
            None
        }
    };

    let weekly_days: BTreeSet<u8> = input.weekly_days.unwrap_or_default().into_iter().collect();
    if weekly_days.iter().any(|day| *day > 6) {
        errors.push("Weekday indices run 0 (Sunday) through 6 (Saturday).".to_string());
    }
    if frequency == Some(Frequency::Weekly) && weekly_days.is_empty() {
        errors.push("Pick at least one weekday for weekly service.".to_string());
    }

    let anchor = match input.date.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => match parse_day(raw) {
            Some(day) => Some(day),
            None => {
                errors.push(format!("Unreadable service date '{raw}'."));
                None
            }
        },
        _ => {
            errors.push("Please pick a service date.".to_string());
            None
        }
    };

    let start = match input.start_date.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => match parse_day(raw) {
            Some(day) => Some(day),
            None => {
                errors.push(format!("Unreadable start date '{raw}'."));
                None
            }
        },
        _ => None,
    };

    let end = match input.end_date.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => match parse_day(raw) {
            Some(day) => Some(day),
            None => {
                errors.push(format!("Unreadable end date '{raw}'."));
                None
            }
        },
        _ => None,
    };

    if let (Some(start_day), Some(end_day)) = (start.or(anchor), end) {
        if end_day < start_day {
            errors.push("End date precedes the start date.".to_string());
        }
    }

    let (frequency, anchor) = match (frequency, anchor) {
        (Some(frequency), Some(anchor)) if errors.is_empty() => (frequency, anchor),
        _ => {
            return Ok(HttpResponse::UnprocessableEntity().json(json!({ "errors": errors })));
        }
    };

    let booking_id = new_id();
    let now = chrono::Utc::now().to_rfc3339();
    let start_day = start.unwrap_or(anchor);
    let weekly_csv = if weekly_days.is_empty() {
        None
    } else {
        Some(weekly_days_to_csv(&weekly_days))
    };
    let notes = input
        .notes
        .as_deref()
        .map(str::trim)
        .filter(|notes| !notes.is_empty())
        .map(str::to_string);

    sqlx::query(
        r#"INSERT INTO bookings
           (id, customer_id, customer_name, customer_phone, address, service, notes, frequency,
            weekly_days, date, start_date, end_date, status, service_status, worker_id,
            created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)"#,
    )
    .bind(&booking_id)
    .bind(&auth.id)
    .bind(&customer_name)
    .bind(&customer_phone)
    .bind(&address)
    .bind(&service)
    .bind(&notes)
    .bind(frequency.as_str())
    .bind(&weekly_csv)
    .bind(anchor.format("%Y-%m-%d").to_string())
    .bind(start_day.format("%Y-%m-%d").to_string())
    .bind(end.map(|day| day.format("%Y-%m-%d").to_string()))
    .bind(STATUS_PENDING)
    .bind(SERVICE_ACTIVE)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    log_activity(
        &state.db,
        "booking_created",
        &format!("{customer_name} requested {service}."),
        Some(&auth.id),
        Some(&booking_id),
    )
    .await;

    if let Some(subscription) = input
        .push_subscription
        .as_deref()
        .filter(|value| !value.trim().is_empty())
    {
        let _ = push::store_subscription(&state.db, &booking_id, subscription).await;
        let booking_url = format!("/bookings/{booking_id}");
        push::notify_booking(
            &state,
            &booking_id,
            push::Notification {
                title: "Booking request received",
                body: "We received your booking request. We'll confirm shortly.",
                url: &booking_url,
            },
        )
        .await;
    }

    let Some(row) = db::fetch_booking(&state.db, &booking_id).await? else {
        return Err(ApiError::Internal("booking missing after insert".to_string()));
    };
    let view = to_view(&row);
    let _ = state.events.send(ServerEvent::from_row("booking_created", row));

    Ok(HttpResponse::Created().json(view))
}

async fn booking_detail(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let booking_id = path.into_inner();
    let booking = db::fetch_booking(&state.db, &booking_id)
        .await?
        .ok_or(ApiError::NotFound("booking"))?;
    ledger::ensure_booking_access(&booking, &auth)?;

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

async fn valid_dates(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let booking_id = path.into_inner();
    let booking = db::fetch_booking(&state.db, &booking_id)
        .await?
        .ok_or(ApiError::NotFound("booking"))?;
    ledger::ensure_booking_access(&booking, &auth)?;

    let spec = ScheduleSpec::from_row(&booking)?;
    let today = state.attendance.today();
    let rows = ledger::list_for_booking(&state.db, &booking.id).await?;
    let marked_dates: Vec<chrono::NaiveDate> = rows.iter().map(|row| row.date).collect();
    let is_active = booking.service_status == SERVICE_ACTIVE
        && state.attendance.backfill_open(&spec, today);

    Ok(HttpResponse::Ok().json(json!({
        "frequency": spec.frequency.as_str(),
        "weekly_days": spec.weekly_days.iter().copied().collect::<Vec<u8>>(),
        "valid_dates": spec.expand(),
        "marked_dates": marked_dates,
        "is_active": is_active,
        "start_date": spec.effective_start(),
        "end_date": spec.effective_end(),
    })))
}

async fn attendance_history(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, ApiError> {
    let booking_id = path.into_inner();
    let booking = db::fetch_booking(&state.db, &booking_id)
        .await?
        .ok_or(ApiError::NotFound("booking"))?;
    ledger::ensure_booking_access(&booking, &auth)?;

    let today = state.attendance.today();
    let mut merged = ledger::reconciled_for_booking(&state.db, &booking, today).await?;
    // interactive history reads newest-first unless asked otherwise
    if query.order.as_deref() != Some("asc") {
        merged.reverse();
    }

    Ok(HttpResponse::Ok().json(merged))
}

async fn mark_attendance(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    path: web::Path<String>,
    payload: web::Json<MarkInput>,
) -> Result<HttpResponse, ApiError> {
    let booking_id = path.into_inner();
    let input = payload.into_inner();

    let status: AttendanceStatus = input
        .status
        .unwrap_or_default()
        .parse()
        .map_err(ApiError::Validation)?;
    let date = match input.date.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => Some(
            parse_day(raw).ok_or_else(|| ApiError::InvalidDate(format!("unreadable date '{raw}'")))?,
        ),
        _ => None,
    };

    let booking = db::fetch_booking(&state.db, &booking_id)
        .await?
        .ok_or(ApiError::NotFound("booking"))?;

    let record =
        ledger::mark_attendance(&state.db, &state.attendance, &booking, date, status, &auth).await?;

    log_activity(
        &state.db,
        "attendance_marked",
        &format!(
            "{} marked {} on {} for {}.",
            auth.display_name, status, record.date, booking.customer_name
        ),
        Some(&auth.id),
        Some(&booking_id),
    )
    .await;

    let booking_url = format!("/bookings/{booking_id}");
    let note_body = format!("{} marked {} for {}.", record.date, status, booking.service);
    push::notify_booking(
        &state,
        &booking_id,
        push::Notification {
            title: "Attendance updated",
            body: &note_body,
            url: &booking_url,
        },
    )
    .await;

    if let Some(row) = db::fetch_booking(&state.db, &booking_id).await? {
        let _ = state.events.send(
            ServerEvent::from_row("attendance_marked", row)
                .with_attendance(record.date, status.as_str()),
        );
    }

    let today = state.attendance.today();
    let log = ledger::log_for_booking(&state.db, &booking, today).await?;

    Ok(HttpResponse::Ok().json(json!({
        "record": record,
        "booking": to_view(&booking),
        "attendance_log": log,
    })))
}

async fn subscribe_notifications(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let booking_id = path.into_inner();
    if db::fetch_booking(&state.db, &booking_id).await?.is_none() {
        return Err(ApiError::NotFound("booking"));
    }

    let raw = String::from_utf8(body.to_vec()).unwrap_or_default();
    if raw.trim().is_empty() {
        return Err(ApiError::Validation("empty subscription payload".to_string()));
    }

    let _ = push::store_subscription(&state.db, &booking_id, &raw).await;
    let booking_url = format!("/bookings/{booking_id}");
    push::notify_booking(
        &state,
        &booking_id,
        push::Notification {
            title: "Notifications enabled",
            body: "You'll receive updates about this booking.",
            url: &booking_url,
        },
    )
    .await;

    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}

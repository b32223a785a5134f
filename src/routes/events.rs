use actix_web::{http::header, web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use chrono::NaiveDate;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::{
    auth::staff_validator,
    db,
    error::ApiError,
    state::{AppState, ServerEvent},
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/events")
            .wrap(HttpAuthentication::basic(staff_validator))
            .route(web::get().to(stream_events)),
    )
    .service(web::resource("/bookings/{id}/events").route(web::get().to(stream_booking_events)));
}

/// Staff firehose: every booking and attendance change on one channel.
async fn stream_events(state: web::Data<AppState>) -> HttpResponse {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<web::Bytes, actix_web::Error>(event_to_bytes(&event))),
        Err(_) => None,
    });

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream)
}

fn event_to_bytes(event: &ServerEvent) -> web::Bytes {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    web::Bytes::from(format!("event: update\ndata: {}\n\n", payload))
}

/// What the unauthenticated status page may see. The full [`ServerEvent`]
/// carries contact details that stay on the staff channel.
#[derive(serde::Serialize)]
struct PublicStatusEvent {
    kind: String,
    booking_id: Option<String>,
    status: Option<String>,
    service_status: Option<String>,
    worker_name: Option<String>,
    attendance_date: Option<NaiveDate>,
    attendance_status: Option<String>,
}

/// Per-booking stream for the customer status page; the booking id is the
/// only credential.
async fn stream_booking_events(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let booking_id = path.into_inner();
    if db::fetch_booking(&state.db, &booking_id).await?.is_none() {
        return Err(ApiError::NotFound("booking"));
    }

    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |result| {
        let event = match result {
            Ok(event) => event,
            Err(_) => return None,
        };
        if event.booking_id.as_deref() != Some(&booking_id) {
            return None;
        }
        let public = PublicStatusEvent {
            kind: event.kind,
            booking_id: event.booking_id,
            status: event.status,
            service_status: event.service_status,
            worker_name: event.worker_name,
            attendance_date: event.attendance_date,
            attendance_status: event.attendance_status,
        };
        Some(Ok::<web::Bytes, actix_web::Error>(public_event_to_bytes(
            &public,
        )))
    });

    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream))
}

fn public_event_to_bytes(event: &PublicStatusEvent) -> web::Bytes {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    web::Bytes::from(format!("event: update\ndata: {}\n\n", payload))
}

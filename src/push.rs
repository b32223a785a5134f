use serde::Deserialize;
use sqlx::SqlitePool;
use web_push::{
    ContentEncoding, IsahcWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessageBuilder, URL_SAFE_NO_PAD,
};

use crate::{
    auth::new_id,
    state::{AppState, PushConfig},
};

/// Attendance and status notices are stale after a day; push services may
/// drop them once the TTL passes.
const NOTIFICATION_TTL_SECONDS: u32 = 24 * 60 * 60;

/// One notification as shown by the browser. `url` is the in-app path a
/// click should open.
pub struct Notification<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub url: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubscriptionPayload {
    endpoint: String,
    keys: SubscriptionKeys,
}

#[derive(Debug, Deserialize)]
struct SubscriptionKeys {
    p256dh: String,
    auth: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    endpoint: String,
    p256dh: String,
    auth: String,
}

/// Stores (or refreshes) a browser push subscription for a booking. A
/// malformed payload is dropped with a warning; subscription upkeep is never
/// worth failing a request over.
pub async fn store_subscription(
    pool: &SqlitePool,
    booking_id: &str,
    raw_subscription: &str,
) -> Result<(), sqlx::Error> {
    let payload: SubscriptionPayload = match serde_json::from_str(raw_subscription) {
        Ok(value) => value,
        Err(err) => {
            log::warn!("Invalid push subscription payload: {err}");
            return Ok(());
        }
    };
    if payload.endpoint.trim().is_empty() {
        log::warn!("Push subscription without an endpoint, ignoring");
        return Ok(());
    }

    sqlx::query(
        r#"INSERT INTO push_subscriptions (id, booking_id, endpoint, p256dh, auth, created_at)
           VALUES (?, ?, ?, ?, ?, ?)
           ON CONFLICT(booking_id, endpoint) DO UPDATE SET
             p256dh = excluded.p256dh,
             auth = excluded.auth"#,
    )
    .bind(new_id())
    .bind(booking_id)
    .bind(payload.endpoint)
    .bind(payload.keys.p256dh)
    .bind(payload.keys.auth)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Fans a notification out to every subscription stored for the booking.
/// Subscriptions the push service reports as gone are deleted so dead
/// endpoints do not accumulate.
pub async fn notify_booking(state: &AppState, booking_id: &str, note: Notification<'_>) {
    if !state.push.enabled() {
        return;
    }

    let rows = sqlx::query_as::<_, SubscriptionRow>(
        "SELECT id, endpoint, p256dh, auth FROM push_subscriptions WHERE booking_id = ?",
    )
    .bind(booking_id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    if rows.is_empty() {
        return;
    }

    let payload = serde_json::json!({
        "title": note.title,
        "body": note.body,
        "url": note.url,
    })
    .to_string();

    for row in rows {
        match send_push(&state.push, &row, &payload).await {
            Ok(()) => {}
            Err(WebPushError::EndpointNotValid) | Err(WebPushError::EndpointNotFound) => {
                log::info!("Removing dead push subscription {}", row.id);
                let _ = sqlx::query("DELETE FROM push_subscriptions WHERE id = ?")
                    .bind(&row.id)
                    .execute(&state.db)
                    .await;
            }
            Err(err) => log::warn!("Push send failed: {err}"),
        }
    }
}

async fn send_push(
    config: &PushConfig,
    row: &SubscriptionRow,
    payload: &str,
) -> Result<(), WebPushError> {
    let subscription = SubscriptionInfo::new(
        row.endpoint.clone(),
        row.p256dh.clone(),
        row.auth.clone(),
    );
    let mut builder = WebPushMessageBuilder::new(&subscription);
    builder.set_payload(ContentEncoding::Aes128Gcm, payload.as_bytes());
    builder.set_ttl(NOTIFICATION_TTL_SECONDS);

    let mut vapid_builder =
        VapidSignatureBuilder::from_base64(&config.private_key, URL_SAFE_NO_PAD, &subscription)?;
    vapid_builder.add_claim("sub", config.subject.clone());

    builder.set_vapid_signature(vapid_builder.build()?);

    let client = IsahcWebPushClient::new()?;
    client.send(builder.build()?).await?;
    Ok(())
}

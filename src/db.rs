use std::{env, fs, path::Path};

use chrono::Utc;
use sqlx::SqlitePool;

use crate::{
    auth::{hash_password, new_id},
    models::{BookingRow, UserRow, ROLE_ADMIN, ROLE_CUSTOMER, ROLE_WORKER},
};

/// Canonical booking projection. Every consumer reads bookings through this
/// shape so the worker join and column order never drift between call sites.
const BOOKING_SELECT: &str = r#"SELECT b.id, b.customer_id, b.customer_name, b.customer_phone, b.address,
       b.service, b.notes, b.frequency, b.weekly_days, b.date, b.start_date,
       b.end_date, b.status, b.service_status, b.worker_id,
       u.display_name AS worker_name, b.created_at, b.updated_at
  FROM bookings b
  LEFT JOIN users u ON b.worker_id = u.id"#;

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub fn ensure_sqlite_dir(db_url: &str) -> std::io::Result<()> {
    let path = if let Some(path) = db_url.strip_prefix("sqlite://") {
        Some(path)
    } else if let Some(path) = db_url.strip_prefix("sqlite:") {
        Some(path)
    } else {
        None
    };

    let Some(path) = path else {
        return Ok(());
    };

    let path = path.split('?').next().unwrap_or(path);
    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }

    let path = path.strip_prefix("file:").unwrap_or(path);
    let db_path = Path::new(path);
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub async fn seed_defaults(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    seed_admin(pool).await?;
    seed_demo(pool).await?;
    Ok(())
}

/// Best-effort audit trail; a failed insert is logged and swallowed so it
/// never turns a successful action into an error response.
pub async fn log_activity(
    pool: &SqlitePool,
    kind: &str,
    message: &str,
    user_id: Option<&str>,
    booking_id: Option<&str>,
) {
    let result = sqlx::query(
        r#"INSERT INTO activities (id, kind, message, created_at, user_id, booking_id)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(new_id())
    .bind(kind)
    .bind(message)
    .bind(Utc::now().to_rfc3339())
    .bind(user_id)
    .bind(booking_id)
    .execute(pool)
    .await;
    if let Err(err) = result {
        log::warn!("Failed to record activity '{kind}': {err}");
    }
}

pub async fn fetch_booking(
    pool: &SqlitePool,
    booking_id: &str,
) -> Result<Option<BookingRow>, sqlx::Error> {
    let query = format!("{BOOKING_SELECT} WHERE b.id = ? LIMIT 1");
    sqlx::query_as::<_, BookingRow>(&query)
        .bind(booking_id)
        .fetch_optional(pool)
        .await
}

pub async fn list_bookings_for_customer(
    pool: &SqlitePool,
    customer_id: &str,
) -> Result<Vec<BookingRow>, sqlx::Error> {
    let query = format!("{BOOKING_SELECT} WHERE b.customer_id = ? ORDER BY b.created_at DESC");
    sqlx::query_as::<_, BookingRow>(&query)
        .bind(customer_id)
        .fetch_all(pool)
        .await
}

pub async fn list_bookings_for_worker(
    pool: &SqlitePool,
    worker_id: &str,
) -> Result<Vec<BookingRow>, sqlx::Error> {
    let query = format!("{BOOKING_SELECT} WHERE b.worker_id = ? ORDER BY b.date ASC, b.created_at DESC");
    sqlx::query_as::<_, BookingRow>(&query)
        .bind(worker_id)
        .fetch_all(pool)
        .await
}

pub async fn list_bookings_admin(
    pool: &SqlitePool,
    status: Option<&str>,
) -> Result<Vec<BookingRow>, sqlx::Error> {
    match status {
        Some(status) => {
            let query = format!("{BOOKING_SELECT} WHERE b.status = ? ORDER BY b.created_at DESC");
            sqlx::query_as::<_, BookingRow>(&query)
                .bind(status)
                .fetch_all(pool)
                .await
        }
        None => {
            let query = format!("{BOOKING_SELECT} ORDER BY b.created_at DESC");
            sqlx::query_as::<_, BookingRow>(&query).fetch_all(pool).await
        }
    }
}

pub async fn fetch_user(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(
        r#"SELECT id, username, display_name, role, password_hash, active, created_at
           FROM users WHERE id = ? LIMIT 1"#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

/// Deletes a booking together with its attendance rows and push
/// subscriptions in one transaction. Activity entries are kept as history.
pub async fn delete_booking_cascade(
    pool: &SqlitePool,
    booking_id: &str,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM attendance WHERE booking_id = ?")
        .bind(booking_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM push_subscriptions WHERE booking_id = ?")
        .bind(booking_id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM bookings WHERE id = ?")
        .bind(booking_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(result.rows_affected() > 0)
}

async fn insert_user(
    pool: &SqlitePool,
    username: &str,
    display_name: &str,
    role: &str,
    password: &str,
) -> Result<String, sqlx::Error> {
    let password_hash =
        hash_password(password).map_err(|_| sqlx::Error::Protocol("password hash failed".into()))?;
    let id = new_id();
    sqlx::query(
        r#"INSERT INTO users (id, username, display_name, role, password_hash, active, created_at)
           VALUES (?, ?, ?, ?, ?, 1, ?)"#,
    )
    .bind(&id)
    .bind(username)
    .bind(display_name)
    .bind(role)
    .bind(password_hash)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(id)
}

async fn seed_admin(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let existing =
        sqlx::query_as::<_, (String,)>("SELECT id FROM users WHERE role = ? LIMIT 1")
            .bind(ROLE_ADMIN)
            .fetch_optional(pool)
            .await?;
    if existing.is_some() {
        return Ok(());
    }

    let username = env::var("ADMIN_USER").unwrap_or_else(|_| "admin".to_string());
    let password = env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin".to_string());
    let display_name =
        env::var("ADMIN_DISPLAY_NAME").unwrap_or_else(|_| "Super Admin".to_string());

    if password == "admin" {
        log::warn!("ADMIN_PASSWORD not set. Using default password 'admin'. Set ADMIN_PASSWORD in production.");
    }

    insert_user(pool, &username, &display_name, ROLE_ADMIN, &password).await?;
    Ok(())
}

async fn seed_demo(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let demo = env::var("SEED_DEMO").unwrap_or_else(|_| "false".to_string());
    if demo != "true" {
        return Ok(());
    }

    let worker_exists =
        sqlx::query_as::<_, (String,)>("SELECT id FROM users WHERE role = ? LIMIT 1")
            .bind(ROLE_WORKER)
            .fetch_optional(pool)
            .await?;
    if worker_exists.is_none() {
        let password =
            env::var("DEMO_WORKER_PASSWORD").unwrap_or_else(|_| "change-me".to_string());
        if password == "change-me" {
            log::warn!("DEMO_WORKER_PASSWORD not set. Using default password 'change-me'.");
        }
        insert_user(pool, "asha", "Asha Verma", ROLE_WORKER, &password).await?;
    }

    let customer_exists =
        sqlx::query_as::<_, (String,)>("SELECT id FROM users WHERE role = ? LIMIT 1")
            .bind(ROLE_CUSTOMER)
            .fetch_optional(pool)
            .await?;
    if customer_exists.is_none() {
        let password =
            env::var("DEMO_CUSTOMER_PASSWORD").unwrap_or_else(|_| "change-me".to_string());
        if password == "change-me" {
            log::warn!("DEMO_CUSTOMER_PASSWORD not set. Using default password 'change-me'.");
        }
        insert_user(pool, "rohan", "Rohan Mehta", ROLE_CUSTOMER, &password).await?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    run_migrations(&pool).await.expect("apply migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_booking(pool: &SqlitePool, booking_id: &str) {
        let customer_id =
            insert_user(pool, "cust", "Test Customer", ROLE_CUSTOMER, "pw").await.unwrap();
        let worker_id =
            insert_user(pool, "work", "Test Worker", ROLE_WORKER, "pw").await.unwrap();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO bookings (id, customer_id, customer_name, customer_phone, address,
                    service, frequency, date, start_date, end_date, status, service_status,
                    worker_id, created_at, updated_at)
               VALUES (?, ?, 'Test Customer', '9876500001', '12 Lake View Road',
                    'Daily Housekeeping', 'Daily', '2024-01-01', '2024-01-01', '2024-01-07',
                    'approved', 'active', ?, ?, ?)"#,
        )
        .bind(booking_id)
        .bind(&customer_id)
        .bind(&worker_id)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn migrations_and_admin_seed_apply() {
        let pool = test_pool().await;
        seed_defaults(&pool).await.unwrap();

        let admins: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = 'admin'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(admins, 1);

        // seeding is idempotent
        seed_defaults(&pool).await.unwrap();
        let admins: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = 'admin'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(admins, 1);
    }

    #[tokio::test]
    async fn booking_fetch_includes_worker_name() {
        let pool = test_pool().await;
        seed_booking(&pool, "b1").await;

        let booking = fetch_booking(&pool, "b1").await.unwrap().unwrap();
        assert_eq!(booking.worker_name.as_deref(), Some("Test Worker"));
        assert_eq!(booking.frequency, "Daily");

        assert!(fetch_booking(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cascade_delete_removes_children() {
        let pool = test_pool().await;
        seed_booking(&pool, "b1").await;

        sqlx::query(
            r#"INSERT INTO attendance (id, booking_id, worker_id, customer_id, date, status,
                    marked_by, marked_by_role, marked_at)
               VALUES ('a1', 'b1', 'w', 'c', '2024-01-02', 'present', 'u', 'admin', '2024-01-02T09:00:00Z')"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"INSERT INTO push_subscriptions (id, booking_id, endpoint, p256dh, auth, created_at)
               VALUES ('p1', 'b1', 'https://push.example/ep', 'k', 's', '2024-01-02T09:00:00Z')"#,
        )
        .execute(&pool)
        .await
        .unwrap();

        assert!(delete_booking_cascade(&pool, "b1").await.unwrap());

        let attendance: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attendance")
            .fetch_one(&pool)
            .await
            .unwrap();
        let subscriptions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM push_subscriptions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(attendance, 0);
        assert_eq!(subscriptions, 0);

        assert!(!delete_booking_cascade(&pool, "b1").await.unwrap());
    }
}

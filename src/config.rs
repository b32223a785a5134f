use std::env;

use chrono::{FixedOffset, Offset, Utc};

use crate::state::PushConfig;

/// Reference offset for "today". Attendance days roll over at midnight in
/// this zone, not at UTC midnight.
const DEFAULT_UTC_OFFSET: &str = "+05:30";
const DEFAULT_GRACE_DAYS: i64 = 7;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub zone: FixedOffset,
    pub grace_days: i64,
    pub push: PushConfig,
}

impl Config {
    pub fn load() -> Self {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./data/doorstep.db".to_string());

        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(8080);

        let zone = match env::var("ATTENDANCE_UTC_OFFSET") {
            Ok(raw) => parse_utc_offset(&raw).unwrap_or_else(|| {
                log::warn!(
                    "ATTENDANCE_UTC_OFFSET '{raw}' is not a valid offset, using {DEFAULT_UTC_OFFSET}"
                );
                default_zone()
            }),
            Err(_) => default_zone(),
        };

        let grace_days = match env::var("ATTENDANCE_GRACE_DAYS") {
            Ok(raw) => match raw.trim().parse::<i64>() {
                Ok(days) if days >= 0 => days,
                _ => {
                    log::warn!(
                        "ATTENDANCE_GRACE_DAYS '{raw}' is not a non-negative integer, using {DEFAULT_GRACE_DAYS}"
                    );
                    DEFAULT_GRACE_DAYS
                }
            },
            Err(_) => DEFAULT_GRACE_DAYS,
        };

        let push = PushConfig {
            public_key: env::var("VAPID_PUBLIC_KEY").unwrap_or_default(),
            private_key: env::var("VAPID_PRIVATE_KEY").unwrap_or_default(),
            subject: env::var("PUSH_SUBJECT")
                .unwrap_or_else(|_| "mailto:ops@doorstep.example".to_string()),
        };
        if !push.enabled() {
            log::info!("VAPID keys not set, web push notifications disabled");
        }

        Self {
            database_url,
            port,
            zone,
            grace_days,
            push,
        }
    }
}

fn default_zone() -> FixedOffset {
    parse_utc_offset(DEFAULT_UTC_OFFSET).unwrap_or_else(|| Utc.fix())
}

/// Accepts "+HH:MM" / "-HH:MM" offsets such as "+05:30".
fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    raw.trim().parse::<FixedOffset>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_parse() {
        let ist = parse_utc_offset("+05:30").unwrap();
        assert_eq!(ist.local_minus_utc(), 5 * 3600 + 30 * 60);

        let pst = parse_utc_offset("-08:00").unwrap();
        assert_eq!(pst.local_minus_utc(), -8 * 3600);

        assert!(parse_utc_offset("half past nine").is_none());
        assert!(parse_utc_offset("").is_none());
    }

    #[test]
    fn default_zone_is_ist() {
        assert_eq!(default_zone().local_minus_utc(), 5 * 3600 + 30 * 60);
    }
}

//! Clock utilities for vmexpired
//!
//! Expiration deadlines are absolute UTC instants measured in days, so the
//! service only needs wall-clock time. Everything in the core takes `now` as a
//! parameter; this module is where the daemon gets it from.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `VMEXPIRE_MOCK_TIME` environment variable can be set
//! to shift the clock. The mock clock starts at the given instant and then
//! advances at the real rate, which makes it possible to watch a VM walk
//! through its lifecycle without waiting for weeks.
//!
//! Format: `YYYY-MM-DD HH:MM:SS`, interpreted as UTC.
//!
//! ```bash
//! VMEXPIRE_MOCK_TIME="2026-03-01 09:00:00" vmexpired --config dev.toml
//! ```

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::sync::OnceLock;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "VMEXPIRE_MOCK_TIME";

static MOCK_TIME_OFFSET: OnceLock<Option<Duration>> = OnceLock::new();

fn get_mock_time_offset() -> Option<Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            if let Ok(mock_time_str) = std::env::var(MOCK_TIME_ENV_VAR) {
                match parse_utc(&mock_time_str) {
                    Some(mock) => {
                        let offset = mock.signed_duration_since(Utc::now());
                        tracing::info!(
                            mock_time = %mock_time_str,
                            offset_secs = offset.num_seconds(),
                            "Mock time enabled"
                        );
                        return Some(offset);
                    }
                    None => {
                        tracing::warn!(
                            mock_time = %mock_time_str,
                            expected_format = "%Y-%m-%d %H:%M:%S",
                            "Invalid mock time format"
                        );
                    }
                }
            }
            None
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Current UTC time, shifted by `VMEXPIRE_MOCK_TIME` in debug builds.
pub fn now() -> DateTime<Utc> {
    let real_now = Utc::now();
    match get_mock_time_offset() {
        Some(offset) => real_now + offset,
        None => real_now,
    }
}

/// A whole number of days as a chrono duration
pub fn days(n: u32) -> Duration {
    Duration::days(i64::from(n))
}

/// Parse a mock-time style timestamp (`YYYY-MM-DD HH:MM:SS`, UTC)
pub fn parse_utc(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

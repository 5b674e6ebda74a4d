//! Persistence layer — libSQL-backed storage for rules, records, and settings.

use chrono::{DateTime, Utc};

pub mod db;
pub mod migrations;
pub mod records;
pub mod rules;
pub mod settings;

pub use db::Database;
pub use records::RecordStore;
pub use rules::RuleStore;
pub use settings::SettingsStore;

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone, Utc};

/// Accepts RFC 3339 or epoch seconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<f64>() {
        let seconds = value.floor() as i64;
        let nanos = ((value - value.floor()) * 1_000_000_000.0) as u32;
        return Utc
            .timestamp_opt(seconds, nanos)
            .single()
            .with_context(|| format!("timestamp out of range: {raw}"));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp {raw:?}; expected RFC 3339 or epoch seconds"))
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    let dt = at.with_timezone(&Local);
    let seconds = Local::now().signed_duration_since(dt).num_seconds();
    if (0..60).contains(&seconds) {
        format!("{seconds}s ago")
    } else if (0..3600).contains(&seconds) {
        format!("{}m ago", seconds / 60)
    } else if (0..86_400).contains(&seconds) {
        format!("{}h ago", seconds / 3600)
    } else {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

pub fn format_duration(seconds: f64) -> String {
    if seconds < 0.001 {
        format!("{:.0}μs", seconds * 1_000_000.0)
    } else if seconds < 1.0 {
        format!("{:.1}ms", seconds * 1000.0)
    } else if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor() as i64;
        let secs = (seconds % 60.0).floor() as i64;
        format!("{minutes}m {secs}s")
    } else {
        let hours = (seconds / 3600.0).floor() as i64;
        let minutes = ((seconds % 3600.0) / 60.0).floor() as i64;
        format!("{hours}h {minutes}m")
    }
}

pub fn truncate(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        return value.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let prefix: String = value.chars().take(keep).collect();
    format!("{prefix}...")
}

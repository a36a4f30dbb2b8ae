use serde_json::Value as JsonValue;
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|delta| i64::try_from(delta.as_millis()).ok())
        .unwrap_or(0)
}

pub fn system_time_to_unix_ms(value: SystemTime) -> Option<i64> {
    let delta = value.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(delta.as_millis()).ok()
}

/// One JSON object per line on stderr. All operational logging goes through
/// here so log consumers never have to parse free-form text.
pub fn log_event(event: &'static str, fields: JsonValue) {
    let line = serde_json::json!({
        "ts": now_iso(),
        "event": event,
        "fields": fields,
    });
    use std::io::Write as _;
    let mut out = std::io::stderr().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_iso_is_rfc3339() {
        let value = now_iso();
        assert!(OffsetDateTime::parse(&value, &Rfc3339).is_ok());
    }

    #[test]
    fn unix_ms_roundtrip() {
        let now = SystemTime::now();
        let ms = system_time_to_unix_ms(now).expect("unix ms");
        assert!(ms > 0);
    }
}

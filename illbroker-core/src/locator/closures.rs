use chrono::{DateTime, Local, NaiveDate, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use tracing::warn;

const CLOSURES_KEY: &str = "closures";
const TIME_ZONE_KEY: &str = "timeZone";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Whether a peer is closed at `now` according to the `closures` entries of
/// its custom data.
///
/// Each entry is `{"startDate": "YYYY-MM-DD", "endDate": "YYYY-MM-DD"}`,
/// inclusive on both days, read in the peer's `timeZone` (process-local
/// when absent).
pub fn is_closed(custom_data: &Map<String, Value>, now: DateTime<Utc>) -> bool {
    let Some(closures) = custom_data.get(CLOSURES_KEY).and_then(Value::as_array) else {
        return false;
    };

    let today = local_date(custom_data, now);
    closures.iter().any(|entry| {
        let start = entry.get("startDate").and_then(Value::as_str);
        let end = entry.get("endDate").and_then(Value::as_str);
        let (Some(start), Some(end)) = (start, end) else {
            return false;
        };
        match (parse_date(start), parse_date(end)) {
            (Some(start), Some(end)) => start <= today && today <= end,
            _ => false,
        }
    })
}

fn local_date(custom_data: &Map<String, Value>, now: DateTime<Utc>) -> NaiveDate {
    match custom_data.get(TIME_ZONE_KEY).and_then(Value::as_str) {
        Some(name) => match name.parse::<Tz>() {
            Ok(tz) => now.with_timezone(&tz).date_naive(),
            Err(_) => {
                warn!(time_zone = name, "unknown time zone, using local time");
                now.with_timezone(&Local).date_naive()
            }
        },
        None => now.with_timezone(&Local).date_naive(),
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(raw, DATE_FORMAT) {
        Ok(date) => Some(date),
        Err(err) => {
            warn!(date = raw, error = %err, "ignoring closure with unparseable date");
            None
        }
    }
}

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::slots::model::{IntervalSet, Timestamp};

pub const QUERY_PARAM: &str = "events";
const WRITE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One entry of the persisted `events` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub start: Timestamp,
    pub end: Timestamp,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub events: Vec<DecodedEvent>,
    pub dropped: usize,
    /// The text was not JSON or its root was not an array.
    pub corrupt: bool,
}

impl Decoded {
    fn corrupt() -> Self {
        Self {
            corrupt: true,
            ..Self::default()
        }
    }
}

pub fn decode_events(text: &str) -> Decoded {
    let Ok(root) = serde_json::from_str::<Value>(text) else {
        return Decoded::corrupt();
    };
    let Value::Array(entries) = root else {
        return Decoded::corrupt();
    };

    let mut decoded = Decoded::default();
    for entry in entries {
        match decode_entry(entry) {
            Ok(event) => decoded.events.push(event),
            Err(err) => {
                log::debug!("dropping persisted event: {err:#}");
                decoded.dropped += 1;
            }
        }
    }
    decoded
}

fn decode_entry(entry: Value) -> Result<DecodedEvent> {
    let record = serde_json::from_value::<EventRecord>(entry).context("malformed event entry")?;
    let start = parse_timestamp(&record.start)?;
    let end = parse_timestamp(&record.end)?;
    if start >= end {
        return Err(anyhow!("event '{}' ends before it starts", record.title));
    }
    Ok(DecodedEvent {
        start,
        end,
        title: record.title,
    })
}

pub fn encode_events(set: &IntervalSet) -> Result<String> {
    let records = set
        .iter()
        .map(|interval| EventRecord {
            start: format_timestamp(&interval.start),
            end: format_timestamp(&interval.end),
            title: interval.label.clone(),
        })
        .collect::<Vec<_>>();
    Ok(serde_json::to_string(&records)?)
}

pub fn format_timestamp(timestamp: &Timestamp) -> String {
    timestamp.format(WRITE_FORMAT).to_string()
}

/// Parse a wall-clock timestamp. Offsets are converted to local time.
pub fn parse_timestamp(input: &str) -> Result<Timestamp> {
    let trimmed = input.trim();
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(with_offset.with_timezone(&Local).naive_local());
    }

    const NAIVE_FORMATS: [&str; 5] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed);
        }
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .with_context(|| format!("invalid timestamp '{input}', expected ISO-8601 local datetime"))
}

/// Snapshot of the collection as a query string, `events=<percent-encoded JSON>`.
pub fn encode_query(set: &IntervalSet) -> Result<String> {
    let json = encode_events(set)?;
    Ok(format!("{QUERY_PARAM}={}", urlencoding::encode(&json)))
}

/// Accepts a bare query, a leading `?`, or a path such as `/slots?events=...`.
pub fn decode_query(input: &str) -> Result<Decoded> {
    let query = match input.split_once('?') {
        Some((_, query)) => query,
        None => input,
    };

    let raw = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == QUERY_PARAM)
        .map(|(_, value)| value)
        .with_context(|| format!("query has no '{QUERY_PARAM}' parameter"))?;

    let spaced = raw.replace('+', " ");
    let json = urlencoding::decode(&spaced)
        .with_context(|| format!("'{QUERY_PARAM}' parameter is not valid UTF-8"))?;
    Ok(decode_events(&json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::model::at;

    #[test]
    fn decodes_valid_events() {
        let decoded = decode_events(
            r#"[{"start":"2024-01-01T01:00:00","end":"2024-01-01T03:00:00","title":"gym"}]"#,
        );
        assert!(!decoded.corrupt);
        assert_eq!(decoded.dropped, 0);
        assert_eq!(
            decoded.events,
            vec![DecodedEvent {
                start: at("2024-01-01T01:00"),
                end: at("2024-01-01T03:00"),
                title: "gym".to_string(),
            }]
        );
    }

    #[test]
    fn non_array_root_is_corrupt() {
        assert!(decode_events(r#""not-an-array""#).corrupt);
        assert!(decode_events(r#"{"start":"2024-01-01T01:00:00"}"#).corrupt);
    }

    #[test]
    fn malformed_text_is_corrupt() {
        assert!(decode_events("[{ nope").corrupt);
    }

    #[test]
    fn bad_entries_are_dropped_individually() {
        let decoded = decode_events(
            r#"[
                {"start":"yesterday-ish","end":"2024-01-01T03:00:00","title":"bad"},
                {"start":"2024-01-01T05:00:00","end":"2024-01-01T04:00:00","title":"backwards"},
                42,
                {"start":"2024-01-02T01:00:00","end":"2024-01-02T02:00:00"}
            ]"#,
        );
        assert!(!decoded.corrupt);
        assert_eq!(decoded.dropped, 3);
        assert_eq!(decoded.events.len(), 1);
        assert_eq!(decoded.events[0].title, "");
    }

    #[test]
    fn parses_common_timestamp_shapes() {
        let expected = at("2024-01-01T01:00");
        assert_eq!(parse_timestamp("2024-01-01T01:00:00").expect("iso"), expected);
        assert_eq!(parse_timestamp("2024-01-01T01:00:00.000").expect("millis"), expected);
        assert_eq!(parse_timestamp("2024-01-01T01:00").expect("no seconds"), expected);
        assert_eq!(parse_timestamp("2024-01-01 01:00:00").expect("space"), expected);
        assert_eq!(
            parse_timestamp("2024-01-01").expect("date only"),
            at("2024-01-01T00:00")
        );
        assert!(parse_timestamp("2024-01-01T25:00:00").is_err());
    }

    #[test]
    fn offset_timestamps_are_converted_to_local_wall_clock() {
        let parsed = parse_timestamp("2024-01-01T01:00:00Z").expect("rfc3339");
        let expected = DateTime::parse_from_rfc3339("2024-01-01T01:00:00Z")
            .expect("rfc3339")
            .with_timezone(&Local)
            .naive_local();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn encodes_with_title_field() {
        let mut set = IntervalSet::new();
        set.push(at("2024-01-01T01:00"), at("2024-01-01T03:00"), "gym");
        let text = encode_events(&set).expect("encode");
        assert_eq!(
            text,
            r#"[{"start":"2024-01-01T01:00:00","end":"2024-01-01T03:00:00","title":"gym"}]"#
        );
    }

    #[test]
    fn query_transport_carries_the_same_collection() {
        let mut set = IntervalSet::new();
        set.push(at("2024-01-01T01:00"), at("2024-01-01T03:00"), "deep work & review");
        let query = encode_query(&set).expect("encode");
        assert!(query.starts_with("events="));
        assert!(!query.contains(' '));

        let decoded = decode_query(&format!("/slots?{query}")).expect("decode");
        assert_eq!(decoded.events.len(), 1);
        assert_eq!(decoded.events[0].title, "deep work & review");
        assert_eq!(decoded.events[0].end, at("2024-01-01T03:00"));
    }

    #[test]
    fn query_without_events_parameter_fails() {
        let err = decode_query("foo=bar").expect_err("missing parameter");
        assert!(err.to_string().contains("no 'events' parameter"));
    }
}

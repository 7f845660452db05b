//! Translation of JSON sidecar fields (Google Takeout style) into tool tags.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use super::Tags;
use crate::date::format_tag_date;

/// Tool tag and the flattened sidecar keys that feed it, in preference order.
const SIDECAR_TAGS: &[(&str, &[&str])] = &[
    (
        "FileCreateDate",
        &["CreationTimestampMs", "CreationTimeFormatted", "CreationTimeTimestamp"],
    ),
    (
        "DateTimeOriginal",
        &["PhotoTakenTimeFormatted", "PhotoTakenTimeTimestamp"],
    ),
    ("GPSAltitude", &["GeoDataAltitude", "GeoDataExifAltitude"]),
    (
        "GPSLatitude",
        &[
            "GeoDataLatitude",
            "GeoDataLatitudeSpan",
            "GeoDataExifLatitude",
            "GeoDataExifLatitudeSpan",
        ],
    ),
    (
        "GPSLongitude",
        &[
            "GeoDataLongitude",
            "GeoDataLongitudeSpan",
            "GeoDataExifLongitude",
            "GeoDataExifLongitudeSpan",
        ],
    ),
];

const FORMATTED_DATE_FORMATS: &[&str] = &["%b %d, %Y, %I:%M:%S %p UTC", "%d %b %Y, %H:%M:%S UTC"];

fn target_tag(key: &str) -> Option<&'static str> {
    SIDECAR_TAGS
        .iter()
        .find(|(_, keys)| keys.contains(&key))
        .map(|(tag, _)| *tag)
}

/// Map flattened sidecar fields onto tool tags. Known fields are converted
/// (epoch numbers and formatted strings become tag dates); the first value
/// that converts wins. Unknown fields pass through unchanged.
pub fn translate(flat: &Tags) -> Tags {
    let mut tags = Tags::new();

    for (_, keys) in SIDECAR_TAGS {
        for key in keys.iter() {
            let Some(raw) = flat.get(*key) else { continue };
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let Some(tag) = target_tag(key) else { continue };
            if tag.starts_with("GPS") && raw.parse::<f64>().map_or(false, |v| v == 0.0) {
                // Takeout writes 0.0 for "no location"
                continue;
            }
            if tags.contains_key(tag) {
                continue;
            }
            // an unreadable date leaves the tag open for the next key
            if let Some(value) = convert_value(key, raw) {
                tags.insert(tag.to_string(), value);
            }
        }
    }

    for (key, value) in flat {
        if target_tag(key).is_none() {
            tags.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    tags
}

/// Date keys yield a tag date or nothing; other keys pass through unchanged.
fn convert_value(key: &str, raw: &str) -> Option<String> {
    let lower = key.to_ascii_lowercase();
    let is_date = lower.ends_with("timestampms")
        || lower.ends_with("timestamp")
        || lower.ends_with("formatted");
    if !is_date {
        return Some(raw.to_string());
    }

    let converted = if let Ok(number) = raw.parse::<f64>() {
        if lower.ends_with("timestampms") {
            DateTime::from_timestamp_millis(number as i64)
        } else if lower.ends_with("timestamp") {
            DateTime::from_timestamp(number as i64, 0)
        } else {
            None
        }
    } else if lower.ends_with("formatted") {
        parse_formatted(raw)
    } else {
        None
    };

    converted.map(|utc| format_tag_date(&utc.with_timezone(&chrono::Local).naive_local()))
}

/// `Aug 15, 2023, 1:45:01 PM UTC`
fn parse_formatted(raw: &str) -> Option<DateTime<Utc>> {
    let cleaned = raw.replace(['\u{202f}', '\u{a0}'], " ");
    FORMATTED_DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(&cleaned, f).ok())
        .map(|naive| naive.and_utc())
}

/// Flatten a sidecar document the way exiftool names JSON fields:
/// `{"photoTakenTime": {"timestamp": "1"}}` -> `PhotoTakenTimeTimestamp = 1`.
pub fn flatten_json(value: &Value) -> Tags {
    let mut tags = Tags::new();
    flatten_into(value, String::new(), &mut tags);
    tags
}

fn flatten_into(value: &Value, prefix: String, tags: &mut Tags) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(child, format!("{}{}", prefix, capitalize(key)), tags);
            }
        }
        Value::String(s) if !prefix.is_empty() => {
            tags.insert(prefix, s.clone());
        }
        Value::Number(n) if !prefix.is_empty() => {
            tags.insert(prefix, n.to_string());
        }
        Value::Bool(b) if !prefix.is_empty() => {
            tags.insert(prefix, b.to_string());
        }
        _ => {}
    }
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

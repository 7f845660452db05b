use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime};
use regex::Regex;

static DIGIT_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

/// Dates encoded as epoch numbers in file names: 10 digits are Unix seconds,
/// 13 digits are Java milliseconds. Converted to local wall-clock time.
pub fn timestamps_in(text: &str) -> Vec<NaiveDateTime> {
    DIGIT_RUN_RE
        .find_iter(text)
        .filter_map(|m| {
            let digits = m.as_str();
            let value: i64 = digits.parse().ok()?;
            let utc = match digits.len() {
                10 => DateTime::from_timestamp(value, 0)?,
                13 => DateTime::from_timestamp_millis(value)?,
                _ => return None,
            };
            Some(utc.with_timezone(&chrono::Local).naive_local())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(epoch: i64) -> NaiveDateTime {
        DateTime::from_timestamp(epoch, 0)
            .unwrap()
            .with_timezone(&chrono::Local)
            .naive_local()
    }

    #[test]
    fn test_unix_seconds_and_millis() {
        assert_eq!(timestamps_in("VID_1692107101.mp4"), vec![local(1_692_107_101)]);
        assert_eq!(timestamps_in("1692107101000.jpg"), vec![local(1_692_107_101)]);
    }

    #[test]
    fn test_other_lengths_ignored() {
        assert!(timestamps_in("IMG_001.jpg").is_empty());
        assert!(timestamps_in("12345678901.jpg").is_empty());
    }
}

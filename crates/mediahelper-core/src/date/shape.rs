//! Date shapes such as `yyyyMMddHHmmss`, compiled into regular expressions
//! that tolerate a single separator between fields.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::{Captures, Regex};

/// Shapes in priority order. The first shape that yields a plausible value wins.
pub const DEFAULT_SHAPES: &[&str] = &[
    "yyyyMMddHHmmsszzz",
    "yyyyMMddHHmmss",
    "ddMMMyyyyHHmmss",
    "yyyyMMdd",
];

/// Anything that is not a letter or digit may separate two fields.
const OPTIONAL_SEPARATOR: &str = "([^0-9A-Za-z]?)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Year,
    Month,
    MonthName,
    Day,
    Hour,
    Minute,
    Second,
    Offset,
}

impl Field {
    fn from_token(token: &str) -> Option<Self> {
        let field = match token {
            "yyyy" | "YYYY" => Field::Year,
            "MM" => Field::Month,
            "MMM" => Field::MonthName,
            "dd" | "DD" => Field::Day,
            "HH" => Field::Hour,
            "mm" => Field::Minute,
            "ss" => Field::Second,
            "zzz" => Field::Offset,
            _ => return None,
        };
        Some(field)
    }

    fn pattern(self) -> &'static str {
        match self {
            Field::Year => r"(?:19|20)\d\d",
            Field::Month => r"(?:0[1-9]|1[0-2])",
            Field::MonthName => r"(?i:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)",
            Field::Day => r"(?:0[1-9]|[12]\d|3[01])",
            Field::Hour => r"(?:[01]\d|2[0-3])",
            Field::Minute | Field::Second => r"[0-5]\d",
            Field::Offset => r"[+-]\d\d:\d\d",
        }
    }

    fn format(self) -> &'static str {
        match self {
            Field::Year => "%Y",
            Field::Month => "%m",
            Field::MonthName => "%b",
            Field::Day => "%d",
            Field::Hour => "%H",
            Field::Minute => "%M",
            Field::Second => "%S",
            Field::Offset => "%:z",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("unknown token {token:?} in date shape {shape:?}")]
    UnknownToken { shape: String, token: String },
    #[error("invalid pattern for date shape {shape:?}: {source}")]
    Pattern {
        shape: String,
        #[source]
        source: regex::Error,
    },
}

/// One compiled date shape.
#[derive(Debug)]
pub struct Shape {
    name: String,
    fields: Vec<Field>,
    regex: Regex,
}

impl Shape {
    pub fn compile(shape: &str) -> Result<Self, ShapeError> {
        let fields = split_runs(shape)
            .into_iter()
            .map(|token| {
                Field::from_token(token).ok_or_else(|| ShapeError::UnknownToken {
                    shape: shape.to_string(),
                    token: token.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let body = fields
            .iter()
            .map(|f| f.pattern())
            .collect::<Vec<_>>()
            .join(OPTIONAL_SEPARATOR);
        // A digit right before the first field would mean we matched the tail of a longer number.
        let pattern = format!("(?:^|[^0-9])(?P<value>{})", body);
        let regex = Regex::new(&pattern).map_err(|source| ShapeError::Pattern {
            shape: shape.to_string(),
            source,
        })?;

        Ok(Self {
            name: shape.to_string(),
            fields,
            regex,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every value in `text` that fits this shape and is a real calendar date.
    pub fn parse_all(&self, text: &str) -> Vec<NaiveDateTime> {
        self.regex
            .captures_iter(text)
            .filter_map(|caps| self.parse_captures(&caps))
            .collect()
    }

    /// Rebuild the format with the separators actually found, then parse the match with it.
    fn parse_captures(&self, caps: &Captures) -> Option<NaiveDateTime> {
        let value = caps.name("value")?.as_str();

        let mut format = String::with_capacity(self.fields.len() * 3);
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                // group 0 is the whole match, group 1 is `value`, separators follow
                if let Some(sep) = caps.get(i + 1).and_then(|m| m.as_str().chars().next()) {
                    if !sep.is_alphanumeric() {
                        if sep == '%' {
                            format.push('%');
                        }
                        format.push(sep);
                    }
                }
            }
            format.push_str(field.format());
        }

        if self.fields.contains(&Field::Offset) {
            DateTime::parse_from_str(value, &format)
                .ok()
                .map(|dt| dt.naive_local())
        } else if self.fields.contains(&Field::Hour) {
            NaiveDateTime::parse_from_str(value, &format).ok()
        } else {
            NaiveDate::parse_from_str(value, &format)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        }
    }
}

/// `yyyyMMdd` -> `["yyyy", "MM", "dd"]`
fn split_runs(shape: &str) -> Vec<&str> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut prev: Option<char> = None;
    for (i, c) in shape.char_indices() {
        if let Some(p) = prev {
            if p != c {
                runs.push(&shape[start..i]);
                start = i;
            }
        }
        prev = Some(c);
    }
    if start < shape.len() {
        runs.push(&shape[start..]);
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_split_runs() {
        assert_eq!(split_runs("yyyyMMddHHmmss"), vec!["yyyy", "MM", "dd", "HH", "mm", "ss"]);
        assert_eq!(split_runs("ddMMMyyyy"), vec!["dd", "MMM", "yyyy"]);
    }

    #[test]
    fn test_unknown_token_is_rejected() {
        assert!(matches!(
            Shape::compile("yyyyQQ"),
            Err(ShapeError::UnknownToken { .. })
        ));
    }

    #[test]
    fn test_separators_are_kept_when_present() {
        let shape = Shape::compile("yyyyMMddHHmmss").unwrap();
        assert_eq!(shape.parse_all("20230815_134501.jpg"), vec![dt(2023, 8, 15, 13, 45, 1)]);
        assert_eq!(shape.parse_all("2023-08-15 13.45.01"), vec![dt(2023, 8, 15, 13, 45, 1)]);
        assert_eq!(shape.parse_all("IMG20230815134501"), vec![dt(2023, 8, 15, 13, 45, 1)]);
    }

    #[test]
    fn test_leading_digit_blocks_match() {
        let shape = Shape::compile("yyyyMMdd").unwrap();
        assert!(shape.parse_all("120230815").is_empty());
        assert_eq!(shape.parse_all("x20230815").len(), 1);
    }

    #[test]
    fn test_month_name_and_offset() {
        let named = Shape::compile("ddMMMyyyyHHmmss").unwrap();
        assert_eq!(named.parse_all("15Aug2023 134501"), vec![dt(2023, 8, 15, 13, 45, 1)]);

        let zoned = Shape::compile("yyyyMMddHHmmsszzz").unwrap();
        assert_eq!(
            zoned.parse_all("2023:08:15 13:45:01+03:00"),
            vec![dt(2023, 8, 15, 13, 45, 1)]
        );
    }

    #[test]
    fn test_impossible_calendar_date_is_dropped() {
        let shape = Shape::compile("yyyyMMdd").unwrap();
        assert!(shape.parse_all("20230231").is_empty());
    }

    #[test]
    fn test_all_matches_are_returned() {
        let shape = Shape::compile("yyyyMMdd").unwrap();
        let found = shape.parse_all("trip_20230101_to_20230105");
        assert_eq!(found.len(), 2);
    }
}

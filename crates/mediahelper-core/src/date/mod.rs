//! Capture-date resolution.
//!
//! Candidates come from the file name (date shapes first, epoch numbers as a
//! fallback) and from date tags reported by the metadata tool. Only plausible
//! values count and the earliest one wins.

pub mod numeric;
pub mod shape;

use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDateTime};
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::metadata::{Tags, CREATION_DATE_TAGS, OTHER_DATE_TAGS};
use shape::{Shape, DEFAULT_SHAPES};

/// File-name prefixes known to carry non-date numbers.
pub const DEFAULT_DENYLIST: &[&str] = &[r"^FB_IMG_\d+", r"^received_\d+"];

/// Formats the metadata tool uses for date tags.
const TAG_DATE_FORMATS_ZONED: &[&str] = &["%Y:%m:%d %H:%M:%S%:z", "%Y:%m:%d %H:%M:%S%.f%:z"];
const TAG_DATE_FORMATS_NAIVE: &[&str] = &["%Y:%m:%d %H:%M:%S", "%Y:%m:%d %H:%M:%S%.f"];

static SHAPES: LazyLock<Vec<Shape>> = LazyLock::new(|| {
    DEFAULT_SHAPES
        .iter()
        .map(|s| Shape::compile(s).unwrap())
        .collect()
});

/// Extracts and resolves capture dates. Built once per run and shared by all workers.
#[derive(Debug)]
pub struct DateResolver {
    denylist: Vec<Regex>,
}

impl Default for DateResolver {
    fn default() -> Self {
        Self::new(DEFAULT_DENYLIST).unwrap()
    }
}

impl DateResolver {
    pub fn new<S: AsRef<str>>(denylist: &[S]) -> Result<Self, regex::Error> {
        let denylist = denylist
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { denylist })
    }

    pub fn is_denied(&self, text: &str) -> bool {
        self.denylist.iter().any(|re| re.is_match(text))
    }

    /// Candidate dates found in free-form text such as a file name.
    pub fn extract_candidates(&self, text: &str) -> Vec<NaiveDateTime> {
        let text = normalize_for_matching(text);
        if self.is_denied(&text) {
            return Vec::new();
        }

        let now = Local::now().naive_local();
        for shape in SHAPES.iter() {
            let found: Vec<NaiveDateTime> = shape
                .parse_all(&text)
                .into_iter()
                .filter(|d| is_plausible_at(d, &now))
                .collect();
            if !found.is_empty() {
                return dedup(found);
            }
        }

        let found = numeric::timestamps_in(&text)
            .into_iter()
            .filter(|d| is_plausible_at(d, &now))
            .collect();
        dedup(found)
    }

    /// Dates held by the known date tags; unparsable values are ignored.
    pub fn dates_from_tags(&self, tags: &Tags) -> Vec<NaiveDateTime> {
        let found = CREATION_DATE_TAGS
            .iter()
            .chain(OTHER_DATE_TAGS.iter())
            .filter_map(|tag| tags.get(*tag))
            .filter_map(|value| parse_tag_date(value))
            .collect();
        dedup(found)
    }
}

/// Parse a date tag value such as `2023:08:15 13:45:01+03:00`.
pub fn parse_tag_date(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    for format in TAG_DATE_FORMATS_ZONED {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Some(dt.naive_local());
        }
    }
    for format in TAG_DATE_FORMATS_NAIVE {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt);
        }
    }
    None
}

/// Format a resolved date the way the metadata tool expects it.
pub fn format_tag_date(date: &NaiveDateTime) -> String {
    date.format("%Y:%m:%d %H:%M:%S").to_string()
}

/// Strictly after 1900 and strictly before now.
pub fn is_plausible(date: &NaiveDateTime) -> bool {
    is_plausible_at(date, &Local::now().naive_local())
}

pub fn is_plausible_at(date: &NaiveDateTime, now: &NaiveDateTime) -> bool {
    use chrono::Datelike;
    date.year() > 1900 && date < now
}

/// Earliest plausible candidate, or None when no candidate is plausible.
pub fn resolve<I>(candidates: I) -> Option<NaiveDateTime>
where
    I: IntoIterator<Item = NaiveDateTime>,
{
    let now = Local::now().naive_local();
    candidates
        .into_iter()
        .filter(|d| is_plausible_at(d, &now))
        .min()
}

/// Replace Arabic-Indic, Extended Arabic-Indic and full-width digits with ASCII digits.
pub fn localized_digits_to_ascii(text: &str) -> String {
    text.chars()
        .map(|c| {
            let offset = match c {
                '\u{0660}'..='\u{0669}' => Some(c as u32 - 0x0660),
                '\u{06F0}'..='\u{06F9}' => Some(c as u32 - 0x06F0),
                '\u{FF10}'..='\u{FF19}' => Some(c as u32 - 0xFF10),
                _ => None,
            };
            match offset {
                Some(d) => char::from(b'0' + d as u8),
                None => c,
            }
        })
        .collect()
}

fn normalize_for_matching(text: &str) -> String {
    let composed: String = text.nfkc().collect();
    localized_digits_to_ascii(&composed)
}

fn dedup(mut dates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
    dates.sort_unstable();
    dates.dedup();
    dates
}

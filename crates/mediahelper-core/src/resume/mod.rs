//! Durable per-item record of what a run did, and the replay that lets the
//! next run skip work already done.

pub mod store;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Local};

pub use store::{read_all, ResumeHandle, ResumeLog};

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("cannot create resume log in {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot read resume log {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("incompatible resume log {path} at line {line}")]
    Corrupt { path: PathBuf, line: usize },
    #[error("resume log writer has stopped")]
    Closed,
}

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Copy,
    Duplicate,
    Update,
    Fail,
    NoDate,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Copy => "Copy",
            Operation::Duplicate => "Duplicate",
            Operation::Update => "Update",
            Operation::Fail => "Fail",
            Operation::NoDate => "NoDate",
        }
    }

    /// Operations whose source counts as handled for later runs.
    pub fn completes_source(self) -> bool {
        matches!(self, Operation::Copy | Operation::Duplicate)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Copy" => Ok(Operation::Copy),
            "Duplicate" => Ok(Operation::Duplicate),
            "Update" => Ok(Operation::Update),
            "Fail" => Ok(Operation::Fail),
            "NoDate" => Ok(Operation::NoDate),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRecord {
    pub timestamp: DateTime<Local>,
    pub operation: Operation,
    pub source: String,
    pub destination: Option<PathBuf>,
}

impl ResumeRecord {
    pub fn new(operation: Operation, source: impl Into<String>, destination: Option<&Path>) -> Self {
        Self {
            timestamp: Local::now(),
            operation,
            source: source.into(),
            destination: destination.map(Path::to_path_buf),
        }
    }

    /// `timestamp \t Operation \t source \t destination`
    pub fn to_line(&self) -> String {
        let destination = self
            .destination
            .as_ref()
            .map(|d| escape(&d.to_string_lossy()))
            .unwrap_or_default();
        format!(
            "{}\t{}\t{}\t{}",
            self.timestamp.to_rfc3339(),
            self.operation,
            escape(&self.source),
            destination
        )
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let timestamp = DateTime::parse_from_rfc3339(fields.next()?)
            .ok()?
            .with_timezone(&Local);
        let operation = fields.next()?.parse().ok()?;
        let source = unescape(fields.next()?)?;
        let destination = match fields.next() {
            Some("") | None => None,
            Some(raw) => Some(PathBuf::from(unescape(raw)?)),
        };
        if fields.next().is_some() || source.is_empty() {
            return None;
        }
        Some(Self {
            timestamp,
            operation,
            source,
            destination,
        })
    }
}

fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(field: &str) -> Option<String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            't' => out.push('\t'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            _ => return None,
        }
    }
    Some(out)
}

/// Decides whether an item still needs work. Built once before scheduling
/// and only read afterwards.
#[derive(Debug, Default)]
pub struct ResumeFilter {
    ignores: Vec<String>,
    /// lowercase source -> destinations recorded for it
    completed: HashMap<String, Vec<PathBuf>>,
}

impl ResumeFilter {
    pub fn new<S: AsRef<str>>(ignores: &[S], records: &[ResumeRecord]) -> Self {
        let mut completed: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for record in records.iter().filter(|r| r.operation.completes_source()) {
            let destinations = completed.entry(record.source.to_lowercase()).or_default();
            if let Some(dest) = &record.destination {
                destinations.push(dest.clone());
            }
        }
        Self {
            ignores: ignores
                .iter()
                .map(|s| s.as_ref().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            completed,
        }
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_ignored(&self, identity: &str) -> bool {
        let lower = identity.to_lowercase();
        self.ignores.iter().any(|pattern| lower.contains(pattern))
    }

    /// False when the identity is ignored, or was placed by an earlier run
    /// and a recorded destination is still there.
    pub fn needs_processing(&self, identity: &str) -> bool {
        if self.is_ignored(identity) {
            return false;
        }
        match self.completed.get(&identity.to_lowercase()) {
            Some(destinations) => !destinations.iter().any(|d| d.exists()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_escaping_survives_awkward_paths() {
        let record = ResumeRecord::new(
            Operation::Copy,
            "C:\\photos\\odd\tname.jpg",
            Some(Path::new("/out/2023/08/line\nbreak.jpg")),
        );
        let line = record.to_line();
        assert_eq!(line.matches('\t').count(), 3);
        assert!(!line.contains('\n'));

        let parsed = ResumeRecord::parse_line(&line).unwrap();
        assert_eq!(parsed.operation, Operation::Copy);
        assert_eq!(parsed.source, record.source);
        assert_eq!(parsed.destination, record.destination);
    }

    #[test]
    fn test_fail_without_destination() {
        let record = ResumeRecord::new(Operation::NoDate, "/a/b.jpg", None);
        let parsed = ResumeRecord::parse_line(&record.to_line()).unwrap();
        assert_eq!(parsed.operation, Operation::NoDate);
        assert_eq!(parsed.destination, None);
    }

    #[test]
    fn test_rejects_foreign_lines() {
        assert!(ResumeRecord::parse_line("").is_none());
        assert!(ResumeRecord::parse_line("8/15/2023 1:45:01 PM;Copy;a;b").is_none());
        assert!(ResumeRecord::parse_line("2023-08-15T13:45:01+00:00\tMove\ta\tb").is_none());
        assert!(ResumeRecord::parse_line("2023-08-15T13:45:01+00:00\tCopy\ta\\x\tb").is_none());
    }

    #[test]
    fn test_filter_skips_completed_with_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept.jpg");
        std::fs::write(&kept, b"x").unwrap();
        let gone = dir.path().join("gone.jpg");

        let records = vec![
            ResumeRecord::new(Operation::Copy, "/Src/Kept.JPG", Some(kept.as_path())),
            ResumeRecord::new(Operation::Copy, "/src/gone.jpg", Some(gone.as_path())),
            ResumeRecord::new(Operation::Fail, "/src/failed.jpg", None),
            ResumeRecord::new(Operation::Update, "/src/updated.jpg", Some(kept.as_path())),
        ];
        let filter = ResumeFilter::new::<&str>(&[], &records);

        assert!(!filter.needs_processing("/src/kept.jpg"));
        assert!(filter.needs_processing("/src/gone.jpg"));
        assert!(filter.needs_processing("/src/failed.jpg"));
        assert!(filter.needs_processing("/src/updated.jpg"));
        assert!(filter.needs_processing("/src/new.jpg"));
        assert_eq!(filter.completed_len(), 2);
    }

    #[test]
    fn test_ignore_patterns_are_case_insensitive_substrings() {
        let filter = ResumeFilter::new(&[".Thumbnails", ""], &[]);
        assert!(!filter.needs_processing("/src/.thumbnails/a.jpg"));
        assert!(!filter.needs_processing("/SRC/.THUMBNAILS/b.jpg"));
        assert!(filter.needs_processing("/src/thumbnails/c.jpg"));
    }
}

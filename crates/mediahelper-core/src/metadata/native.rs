//! Built-in metadata backend. Reads EXIF dates with kamadak-exif and JSON
//! sidecars with serde_json; "writing" only moves the file's modification time.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use exif::{In, Reader, Tag};
use filetime::FileTime;
use log::debug;

use super::{sidecar_tags, MetadataClient, MetadataError, MetadataService, Tags};
use crate::date::{format_tag_date, parse_tag_date};

const VERSION: &str = concat!("native-", env!("CARGO_PKG_VERSION"));

/// EXIF field -> tag name reported to callers.
const EXIF_DATE_FIELDS: &[(Tag, &str)] = &[
    (Tag::DateTimeOriginal, "DateTimeOriginal"),
    (Tag::DateTimeDigitized, "CreateDate"),
    (Tag::DateTime, "ModifyDate"),
];

/// Extensions mime_guess does not classify as media.
const EXTRA_MEDIA_EXTENSIONS: &[&str] = &["mts", "m2ts", "heic", "heif", "dng", "cr2", "nef", "arw"];

/// Tags whose value, once written, becomes the file's modification time.
const MTIME_SOURCE_TAGS: &[&str] = &["DateTimeOriginal", "FileCreateDate", "CreateDate"];

#[derive(Debug, Default)]
pub struct NativeService;

impl NativeService {
    pub fn new() -> Self {
        Self
    }
}

impl MetadataService for NativeService {
    fn tool_version(&self) -> &str {
        VERSION
    }

    fn supports_extension(&self, ext: &str) -> bool {
        if EXTRA_MEDIA_EXTENSIONS.contains(&ext) {
            return true;
        }
        mime_guess::from_ext(ext).first().map_or(false, |mime| {
            let top = mime.type_();
            top == mime_guess::mime::IMAGE
                || top == mime_guess::mime::VIDEO
                || top == mime_guess::mime::AUDIO
        })
    }

    fn open_client(&self) -> Result<Box<dyn MetadataClient>, MetadataError> {
        Ok(Box::new(NativeClient))
    }
}

#[derive(Debug, Default)]
pub struct NativeClient;

impl MetadataClient for NativeClient {
    fn read_tags(&mut self, path: &Path) -> Result<Tags, MetadataError> {
        let meta = fs::metadata(path)?;
        let mut tags = Tags::new();

        if let Ok(modified) = meta.modified() {
            let local: DateTime<Local> = modified.into();
            tags.insert(
                "FileModifyDate".to_string(),
                local.format("%Y:%m:%d %H:%M:%S%:z").to_string(),
            );
        }

        let file = File::open(path)?;
        match Reader::new().read_from_container(&mut BufReader::new(file)) {
            Ok(exif) => {
                for (tag, name) in EXIF_DATE_FIELDS {
                    if let Some(field) = exif.get_field(*tag, In::PRIMARY) {
                        let value = field.display_value().to_string();
                        if let Some(dt) = parse_exif_datetime(&value) {
                            tags.insert(name.to_string(), format_tag_date(&dt));
                        }
                    }
                }
                for (tag, name) in [(Tag::Make, "Make"), (Tag::Model, "Model")] {
                    if let Some(field) = exif.get_field(tag, In::PRIMARY) {
                        let value = field.display_value().to_string();
                        tags.insert(name.to_string(), value.trim_matches('"').to_string());
                    }
                }
            }
            Err(e) => debug!("no EXIF in {}: {}", path.display(), e),
        }

        Ok(tags)
    }

    fn read_sidecar_tags(&mut self, path: &Path) -> Result<Tags, MetadataError> {
        let bytes = fs::read(path)?;
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|source| MetadataError::Sidecar {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(sidecar_tags::translate(&sidecar_tags::flatten_json(&value)))
    }

    fn try_write_tags(&mut self, path: &Path, tags: &Tags) -> bool {
        let Some(date) = MTIME_SOURCE_TAGS
            .iter()
            .filter_map(|tag| tags.get(*tag))
            .find_map(|value| parse_tag_date(value))
        else {
            return false;
        };
        let Some(local) = Local.from_local_datetime(&date).earliest() else {
            return false;
        };
        let mtime = FileTime::from_unix_time(local.timestamp(), 0);
        match filetime::set_file_mtime(path, mtime) {
            Ok(()) => true,
            Err(e) => {
                debug!("cannot set mtime on {}: {}", path.display(), e);
                false
            }
        }
    }
}

/// EXIF datetimes carry no zone; they are local wall-clock time as written.
fn parse_exif_datetime(s: &str) -> Option<NaiveDateTime> {
    let cleaned = s
        .trim()
        .replace('-', ":")
        .replace('/', ":")
        .replace('\\', ":")
        .replace('.', ":");

    if let Ok(dt) = NaiveDateTime::parse_from_str(&cleaned, "%Y:%m:%d %H:%M:%S") {
        return Some(dt);
    }

    let date = cleaned.split(' ').next()?;
    NaiveDate::parse_from_str(date, "%Y:%m:%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_exif_datetime_variants() {
        let expected = NaiveDate::from_ymd_opt(2023, 8, 15)
            .unwrap()
            .and_hms_opt(13, 45, 1)
            .unwrap();
        assert_eq!(parse_exif_datetime("2023:08:15 13:45:01"), Some(expected));
        assert_eq!(parse_exif_datetime("2023-08-15 13:45:01"), Some(expected));
        assert_eq!(
            parse_exif_datetime("2023/08/15"),
            Some(expected.date().and_hms_opt(0, 0, 0).unwrap())
        );
        assert_eq!(parse_exif_datetime("garbage"), None);
    }

    #[test]
    fn test_supports_media_extensions() {
        let service = NativeService::new();
        assert!(service.supports_extension("jpg"));
        assert!(service.supports_extension("mp4"));
        assert!(service.supports_extension("mts"));
        assert!(!service.supports_extension("txt"));
        assert!(!service.supports_extension("json"));
    }

    #[test]
    fn test_read_tags_without_exif_reports_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.jpg");
        fs::write(&path, b"not really a jpeg").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

        let tags = NativeClient.read_tags(&path).unwrap();
        let modified = parse_tag_date(&tags["FileModifyDate"]).unwrap();
        let expected = DateTime::from_timestamp(1_600_000_000, 0)
            .unwrap()
            .with_timezone(&Local)
            .naive_local();
        assert_eq!(modified, expected);
        assert!(!tags.contains_key("DateTimeOriginal"));
    }

    #[test]
    fn test_read_sidecar_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IMG_001.jpg.json");
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            r#"{{"title": "IMG_001.jpg", "photoTakenTime": {{"timestamp": "1692107101"}}}}"#
        )
        .unwrap();

        let tags = NativeClient.read_sidecar_tags(&path).unwrap();
        assert!(parse_tag_date(&tags["DateTimeOriginal"]).is_some());
        assert_eq!(tags["Title"], "IMG_001.jpg");
    }

    #[test]
    fn test_malformed_sidecar_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            NativeClient.read_sidecar_tags(&path),
            Err(MetadataError::Sidecar { .. })
        ));
    }

    #[test]
    fn test_write_sets_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        fs::write(&path, b"x").unwrap();

        let mut tags = Tags::new();
        tags.insert("DateTimeOriginal".into(), "2015:06:01 12:00:00".into());
        assert!(NativeClient.try_write_tags(&path, &tags));

        let meta = fs::metadata(&path).unwrap();
        let mtime = FileTime::from_last_modification_time(&meta);
        let expected = Local
            .from_local_datetime(&parse_tag_date("2015:06:01 12:00:00").unwrap())
            .earliest()
            .unwrap();
        assert_eq!(mtime.unix_seconds(), expected.timestamp());

        assert!(!NativeClient.try_write_tags(&path, &Tags::new()));
    }
}

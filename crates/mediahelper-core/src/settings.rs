use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::date::DEFAULT_DENYLIST;
use crate::metadata::Backend;

/// Lower bound for the progress report cadence.
pub const MIN_PROGRESS_INTERVAL_MS: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("no source directories configured")]
    NoSources,
    #[error("no target directory configured")]
    NoTarget,
    #[error("source does not exist: {0}")]
    MissingSource(PathBuf),
    #[error("target {0} is inside source {1}")]
    TargetInsideSource(PathBuf, PathBuf),
    #[error("invalid filename denylist pattern: {0}")]
    Denylist(#[from] regex::Error),
    #[error("cannot read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn default_tasks_count() -> i64 {
    4
}

fn default_true() -> bool {
    true
}

fn default_log_save_delay() -> u64 {
    5000
}

fn default_progress_interval() -> u64 {
    1000
}

fn default_exiftool_path() -> PathBuf {
    PathBuf::from("exiftool")
}

fn default_denylist() -> Vec<String> {
    DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect()
}

/// Run configuration, read from an `appsettings.json`-style document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Settings {
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub target: Option<PathBuf>,
    /// Case-insensitive substrings; a matching identity is skipped.
    #[serde(default)]
    pub ignores: Vec<String>,
    #[serde(default = "default_tasks_count")]
    pub tasks_count: i64,
    /// Lift the worker cap derived from the CPU count.
    #[serde(default)]
    pub enable_super_user_mode: bool,
    #[serde(default = "default_true")]
    pub enable_log_and_resume: bool,
    #[serde(default)]
    pub delete_empty_directories_on_complete: bool,
    #[serde(default)]
    pub auto_fix_arabic_numbers_in_file_name: bool,
    /// Milliseconds between resume log writes.
    #[serde(default = "default_log_save_delay")]
    pub log_save_delay: u64,
    /// Milliseconds between progress reports.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
    #[serde(default)]
    pub temp_directory: Option<PathBuf>,
    /// Where resume logs live; `<target>/.mediahelper/logs` when unset.
    #[serde(default)]
    pub log_directory: Option<PathBuf>,
    #[serde(default)]
    pub metadata_backend: Backend,
    #[serde(default = "default_exiftool_path")]
    pub exif_tool_path: PathBuf,
    /// Pass `-F` to exiftool writes to repair broken maker-note offsets.
    #[serde(default)]
    pub attempt_to_fix_incorrect_offsets: bool,
    #[serde(default = "default_denylist")]
    pub filename_denylist: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            target: None,
            ignores: Vec::new(),
            tasks_count: default_tasks_count(),
            enable_super_user_mode: false,
            enable_log_and_resume: true,
            delete_empty_directories_on_complete: false,
            auto_fix_arabic_numbers_in_file_name: false,
            log_save_delay: default_log_save_delay(),
            progress_interval: default_progress_interval(),
            temp_directory: None,
            log_directory: None,
            metadata_backend: Backend::default(),
            exif_tool_path: default_exiftool_path(),
            attempt_to_fix_incorrect_offsets: false,
            filename_denylist: default_denylist(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let file = File::open(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check everything that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<&Path, SettingsError> {
        if self.sources.is_empty() {
            return Err(SettingsError::NoSources);
        }
        let target = self.target.as_deref().ok_or(SettingsError::NoTarget)?;
        let resolved_target = resolve_existing_prefix(target);
        for source in &self.sources {
            if !source.exists() {
                return Err(SettingsError::MissingSource(source.clone()));
            }
            if !source.is_dir() {
                continue;
            }
            let resolved_source = source.canonicalize().unwrap_or_else(|_| source.clone());
            if target.starts_with(source) || resolved_target.starts_with(&resolved_source) {
                return Err(SettingsError::TargetInsideSource(
                    target.to_path_buf(),
                    source.clone(),
                ));
            }
        }
        for pattern in &self.filename_denylist {
            regex::Regex::new(pattern)?;
        }
        Ok(target)
    }

    /// Worker count actually used for the run.
    pub fn effective_workers(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        effective_workers(self.tasks_count, self.enable_super_user_mode, available)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval.max(MIN_PROGRESS_INTERVAL_MS))
    }

    pub fn log_save_delay(&self) -> Duration {
        Duration::from_millis(self.log_save_delay)
    }

    pub fn temp_directory(&self) -> PathBuf {
        self.temp_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn log_directory(&self, target: &Path) -> PathBuf {
        self.log_directory
            .clone()
            .unwrap_or_else(|| target.join(".mediahelper").join("logs"))
    }
}

/// Canonicalize the longest existing ancestor of `path` and re-append the
/// components that do not exist yet.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        if let Ok(resolved) = existing.canonicalize() {
            return rest.iter().rev().fold(resolved, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = if parent.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    parent
                };
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Values below 1 become 1; without super-user mode the count is capped at
/// half the available cores.
pub fn effective_workers(requested: i64, super_user: bool, available: usize) -> usize {
    let requested = requested.max(1) as usize;
    if super_user {
        requested
    } else {
        requested.min((available / 2).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_workers() {
        assert_eq!(effective_workers(0, false, 8), 1);
        assert_eq!(effective_workers(-3, true, 8), 1);
        assert_eq!(effective_workers(16, false, 8), 4);
        assert_eq!(effective_workers(16, true, 8), 16);
        assert_eq!(effective_workers(3, false, 1), 1);
        assert_eq!(effective_workers(2, false, 8), 2);
    }

    #[test]
    fn test_load_pascal_case_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appsettings.json");
        std::fs::write(
            &path,
            r#"{
                "Sources": ["/photos/a", "/photos/b"],
                "Target": "/sorted",
                "Ignores": [".thumbnails"],
                "TasksCount": 6,
                "EnableSuperUserMode": true,
                "MetadataBackend": "native",
                "AttemptToFixIncorrectOffsets": true
            }"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.sources.len(), 2);
        assert_eq!(settings.target.as_deref(), Some(Path::new("/sorted")));
        assert_eq!(settings.tasks_count, 6);
        assert!(settings.enable_super_user_mode);
        assert!(settings.enable_log_and_resume);
        assert_eq!(settings.metadata_backend, Backend::Native);
        assert!(settings.attempt_to_fix_incorrect_offsets);
        assert!(!Settings::default().attempt_to_fix_incorrect_offsets);
        assert_eq!(settings.log_save_delay, 5000);
        assert_eq!(settings.filename_denylist.len(), DEFAULT_DENYLIST.len());
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        assert!(matches!(settings.validate(), Err(SettingsError::NoSources)));

        settings.sources.push(dir.path().to_path_buf());
        assert!(matches!(settings.validate(), Err(SettingsError::NoTarget)));

        settings.target = Some(dir.path().join("out"));
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::TargetInsideSource(..))
        ));

        let out = tempfile::tempdir().unwrap();
        settings.target = Some(out.path().to_path_buf());
        assert!(settings.validate().is_ok());

        settings.sources.push(dir.path().join("missing"));
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::MissingSource(_))
        ));
    }

    #[test]
    fn test_target_inside_source_through_dot_segments() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        std::fs::create_dir(&source).unwrap();
        std::fs::create_dir(dir.path().join("other")).unwrap();
        let settings = Settings {
            sources: vec![source],
            target: Some(dir.path().join("other/../src/sorted/new")),
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::TargetInsideSource(..))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_target_inside_source_through_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("photos");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mut settings = Settings {
            sources: vec![link.clone()],
            target: Some(real.join("sorted")),
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::TargetInsideSource(..))
        ));

        settings.sources = vec![real];
        settings.target = Some(link.join("sorted"));
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::TargetInsideSource(..))
        ));

        settings.target = Some(dir.path().join("sorted"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_progress_interval_floor() {
        let settings = Settings {
            progress_interval: 5,
            ..Settings::default()
        };
        assert_eq!(settings.progress_interval(), Duration::from_millis(100));
    }
}

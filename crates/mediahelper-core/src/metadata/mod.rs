//! Metadata tool collaborators.
//!
//! A [`MetadataService`] is created once per run and answers run-wide
//! questions (versions, supported extensions). Each worker opens its own
//! [`MetadataClient`] from it and never shares it.

pub mod exiftool;
pub mod native;
pub mod sidecar_tags;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use exiftool::{ExifToolClient, ExifToolService};
pub use native::{NativeClient, NativeService};

/// Tag name -> value, in the tool's tag namespace.
pub type Tags = BTreeMap<String, String>;

/// Tags that receive the resolved capture date.
pub const CREATION_DATE_TAGS: &[&str] = &[
    "FileCreateDate",
    "DateTimeOriginal",
    "CreateDate",
    "SubSecCreateDate",
    "DateTimeDigitized",
];

/// Other tags that may hold a date worth considering.
pub const OTHER_DATE_TAGS: &[&str] = &[
    "FileAccessDate",
    "FileModifyDate",
    "ModifyDate",
    "SubSecModifyDate",
    "SubSecDateTimeOriginal",
    "TimeStamp",
    "AllDates",
];

/// Computed or filesystem-level tags that are never written back.
pub const IGNORED_TAGS: &[&str] = &[
    "SourceFile",
    "ExifToolVersion",
    "FileName",
    "Directory",
    "FileSize",
    "FileModifyDate",
    "FileAccessDate",
    "FileInodeChangeDate",
    "FilePermissions",
    "FileType",
    "FileTypeExtension",
    "MIMEType",
    "ImageSize",
    "Megapixels",
    "Warning",
    "Error",
];

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata tool not found at {0}")]
    ToolMissing(PathBuf),
    #[error("metadata tool exited unexpectedly")]
    ToolExited,
    #[error("argument contains a line break: {0:?}")]
    UnsafeArgument(String),
    #[error("metadata tool I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot read sidecar {path}: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Which implementation backs the metadata collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// `exiftool` in stay-open mode, one process per worker.
    #[default]
    Exiftool,
    /// Built-in EXIF reader; writes only filesystem timestamps.
    Native,
}

/// Run-wide metadata state, constructed once and shared by reference.
pub trait MetadataService: Send + Sync {
    fn tool_version(&self) -> &str;

    /// Version of the helper that reaps orphaned tool processes, if any.
    fn watcher_version(&self) -> Option<&str> {
        None
    }

    /// `ext` is lowercase and has no leading dot.
    fn supports_extension(&self, ext: &str) -> bool;

    fn open_client(&self) -> Result<Box<dyn MetadataClient>, MetadataError>;
}

/// Per-worker handle to the metadata tool.
pub trait MetadataClient: Send {
    fn read_tags(&mut self, path: &Path) -> Result<Tags, MetadataError>;

    /// Read a JSON sidecar, translated into the same tag namespace as [`read_tags`].
    ///
    /// [`read_tags`]: MetadataClient::read_tags
    fn read_sidecar_tags(&mut self, path: &Path) -> Result<Tags, MetadataError>;

    /// Returns false when the tool reports no update or any error.
    fn try_write_tags(&mut self, path: &Path, tags: &Tags) -> bool;
}

/// Build the service selected in the settings.
pub fn open_service(
    backend: Backend,
    exiftool_path: &Path,
    fix_offsets: bool,
) -> Result<Box<dyn MetadataService>, MetadataError> {
    match backend {
        Backend::Exiftool => Ok(Box::new(ExifToolService::new(exiftool_path, fix_offsets)?)),
        Backend::Native => Ok(Box::new(NativeService::new())),
    }
}

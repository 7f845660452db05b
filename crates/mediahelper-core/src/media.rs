use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate, TimeZone};
use filetime::FileTime;
use log::warn;
use sha2::{Digest, Sha256};

use crate::sidecar;

/// Where an item's bytes live.
#[derive(Debug, Clone)]
pub enum MediaSource {
    File(PathBuf),
    Archived {
        archive: PathBuf,
        entry_index: usize,
        entry_name: String,
        sidecar_index: Option<usize>,
    },
}

/// One logical media file. Archived items are extracted on first access and
/// the extraction is removed when the item is dropped.
#[derive(Debug)]
pub struct MediaItem {
    original_source: String,
    file_name: String,
    source: MediaSource,
    scratch_root: PathBuf,
    materialized: Option<Materialized>,
}

/// Paths usable with ordinary filesystem calls.
#[derive(Debug)]
pub struct Materialized {
    file: PathBuf,
    sidecar: Option<PathBuf>,
    _scratch: Option<ScratchDir>,
}

impl Materialized {
    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn sidecar(&self) -> Option<&Path> {
        self.sidecar.as_deref()
    }
}

impl MediaItem {
    pub fn from_file(path: PathBuf) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            original_source: path.to_string_lossy().into_owned(),
            file_name,
            source: MediaSource::File(path),
            scratch_root: PathBuf::new(),
            materialized: None,
        }
    }

    /// `scratch_root` is the temp directory; extractions go below `<scratch_root>/.zip`.
    pub fn from_archive_entry(
        archive: PathBuf,
        entry_index: usize,
        entry_name: String,
        sidecar_index: Option<usize>,
        scratch_root: PathBuf,
    ) -> Self {
        let original_source = format!("{}.{}", archive.to_string_lossy(), entry_name);
        let file_name = entry_name
            .rsplit('/')
            .next()
            .unwrap_or(&entry_name)
            .to_string();
        Self {
            original_source,
            file_name,
            source: MediaSource::Archived {
                archive,
                entry_index,
                entry_name,
                sidecar_index,
            },
            scratch_root,
            materialized: None,
        }
    }

    /// Stable identity used for resume and ignore matching.
    pub fn original_source(&self) -> &str {
        &self.original_source
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn source(&self) -> &MediaSource {
        &self.source
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized.is_some()
    }

    /// Materialize once; later calls return the cached result.
    pub fn resolve(&mut self) -> io::Result<&Materialized> {
        if self.materialized.is_none() {
            let materialized = match &self.source {
                MediaSource::File(path) => Materialized {
                    file: path.clone(),
                    sidecar: sidecar::find_beside(path),
                    _scratch: None,
                },
                MediaSource::Archived {
                    archive,
                    entry_index,
                    sidecar_index,
                    ..
                } => extract(
                    archive,
                    *entry_index,
                    *sidecar_index,
                    &self.file_name,
                    ScratchDir::create(&self.scratch_root, &self.scratch_prefix())?,
                )?,
            };
            self.materialized = Some(materialized);
        }
        self.materialized
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "media not materialized"))
    }

    /// Sidecar accessor; materializes the item if needed.
    pub fn sidecar(&mut self) -> io::Result<Option<&Path>> {
        Ok(self.resolve()?.sidecar())
    }

    fn scratch_prefix(&self) -> String {
        let digest = Sha256::digest(self.original_source.as_bytes());
        let mut prefix = hex::encode(&digest[..8]);
        prefix.push('-');
        prefix
    }
}

/// A private extraction directory below `<scratch_root>/.zip`, removed with
/// its contents on drop. Every call gets a fresh directory, so items sharing
/// an identity never see each other's files.
#[derive(Debug)]
pub struct ScratchDir {
    dir: Option<tempfile::TempDir>,
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(scratch_root: &Path, prefix: &str) -> io::Result<Self> {
        let base = scratch_root.join(".zip");
        fs::create_dir_all(&base)?;
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(&base)?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!("cannot remove scratch dir {}: {}", self.path.display(), e);
            }
        }
    }
}

fn extract(
    archive_path: &Path,
    entry_index: usize,
    sidecar_index: Option<usize>,
    file_name: &str,
    scratch: ScratchDir,
) -> io::Result<Materialized> {
    let mut archive = zip::ZipArchive::new(File::open(archive_path)?)?;

    let file = scratch.path().join(file_name);
    extract_entry(&mut archive, entry_index, &file)?;

    let sidecar = match sidecar_index {
        Some(index) => {
            let path = scratch.path().join(format!("{}.json", file_name));
            match extract_entry(&mut archive, index, &path) {
                Ok(()) => Some(path),
                Err(e) => {
                    warn!("cannot extract sidecar for {}: {}", file_name, e);
                    None
                }
            }
        }
        None => None,
    };

    Ok(Materialized {
        file,
        sidecar,
        _scratch: Some(scratch),
    })
}

fn extract_entry(
    archive: &mut zip::ZipArchive<File>,
    index: usize,
    dest: &Path,
) -> io::Result<()> {
    let mut entry = archive.by_index(index)?;
    let mut out = File::create(dest)?;
    io::copy(&mut entry, &mut out)?;
    drop(out);

    if let Some(mtime) = entry.last_modified().and_then(zip_time_to_filetime) {
        filetime::set_file_mtime(dest, mtime)?;
    }
    Ok(())
}

/// Zip timestamps are local wall-clock time without a zone.
fn zip_time_to_filetime(dt: zip::DateTime) -> Option<FileTime> {
    let naive = NaiveDate::from_ymd_opt(dt.year() as i32, dt.month() as u32, dt.day() as u32)?
        .and_hms_opt(dt.hour() as u32, dt.minute() as u32, dt.second() as u32)?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    Some(FileTime::from_unix_time(local.timestamp(), 0))
}

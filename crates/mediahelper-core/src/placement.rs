//! Per-item work: resolve the capture date, copy into `Year/Month`, then
//! write the date back through the metadata client.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime};
use filetime::FileTime;
use log::debug;

use crate::date::{self, format_tag_date, localized_digits_to_ascii, DateResolver};
use crate::media::MediaItem;
use crate::metadata::{MetadataClient, Tags, CREATION_DATE_TAGS, IGNORED_TAGS};
use crate::resume::{Operation, ResumeHandle, ResumeRecord};
use crate::stats::Statistics;

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("cannot materialize {0}: {1}")]
    Materialize(String, #[source] io::Error),
    #[error("no plausible capture date for {0}")]
    Unresolvable(String),
    #[error("cannot copy to {dest}: {source}")]
    Copy {
        dest: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("metadata write failed for {0}")]
    MetadataWrite(PathBuf),
}

/// How one item ended.
#[derive(Debug)]
pub enum Outcome {
    /// Copied and tagged.
    Updated(PathBuf),
    /// The destination already existed; nothing was copied or written.
    Duplicate(PathBuf),
    Failed(PlacementError),
}

/// State a worker owns for the whole run.
pub struct WorkerContext {
    pub client: Box<dyn MetadataClient>,
    pub resume: ResumeHandle,
}

/// Shared, read-only placement configuration.
pub struct Placer<'a> {
    pub resolver: &'a DateResolver,
    pub stats: &'a Statistics,
    pub target: &'a Path,
    pub fix_localized_digits: bool,
}

impl Placer<'_> {
    pub fn process(&self, mut item: MediaItem, ctx: &mut WorkerContext) -> Outcome {
        let source_id = item.original_source().to_string();

        let (file, sidecar) = match item.resolve() {
            Ok(m) => (m.file().to_path_buf(), m.sidecar().map(Path::to_path_buf)),
            Err(e) => {
                self.record_fail(ctx, &source_id, None);
                return Outcome::Failed(PlacementError::Materialize(source_id, e));
            }
        };

        let current = read_or_empty(&file, |p| ctx.client.read_tags(p));
        let sidecar_tags = sidecar
            .as_deref()
            .map(|p| read_or_empty(p, |p| ctx.client.read_sidecar_tags(p)))
            .unwrap_or_default();

        let candidates = self
            .resolver
            .extract_candidates(item.file_name())
            .into_iter()
            .chain(self.resolver.dates_from_tags(&current))
            .chain(self.resolver.dates_from_tags(&sidecar_tags));
        let Some(resolved) = date::resolve(candidates) else {
            self.stats.record_fail();
            ctx.resume
                .append(&ResumeRecord::new(Operation::NoDate, &source_id, None));
            return Outcome::Failed(PlacementError::Unresolvable(source_id));
        };

        let dest = self.destination(item.file_name(), &resolved);
        match claim_and_copy(&file, &dest) {
            Ok(Claim::Taken) => {
                self.stats.record_duplicate();
                ctx.resume.append(&ResumeRecord::new(
                    Operation::Duplicate,
                    &source_id,
                    Some(dest.as_path()),
                ));
                return Outcome::Duplicate(dest);
            }
            Ok(Claim::Copied) => {
                self.stats.record_copy();
                ctx.resume
                    .append(&ResumeRecord::new(Operation::Copy, &source_id, Some(dest.as_path())));
            }
            Err(source) => {
                self.record_fail(ctx, &source_id, Some(dest.as_path()));
                return Outcome::Failed(PlacementError::Copy { dest, source });
            }
        }

        let updates = tag_updates(&current, &sidecar_tags, &resolved);
        if ctx.client.try_write_tags(&dest, &updates) {
            self.stats.record_update();
            ctx.resume
                .append(&ResumeRecord::new(Operation::Update, &source_id, Some(dest.as_path())));
            Outcome::Updated(dest)
        } else {
            self.record_fail(ctx, &source_id, Some(dest.as_path()));
            Outcome::Failed(PlacementError::MetadataWrite(dest))
        }
    }

    /// `{target}/{Year:04}/{Month:02}/{file name}`
    pub fn destination(&self, file_name: &str, resolved: &NaiveDateTime) -> PathBuf {
        let file_name = if self.fix_localized_digits {
            localized_digits_to_ascii(file_name)
        } else {
            file_name.to_string()
        };
        self.target
            .join(format!("{:04}", resolved.year()))
            .join(format!("{:02}", resolved.month()))
            .join(file_name)
    }

    fn record_fail(&self, ctx: &WorkerContext, source_id: &str, dest: Option<&Path>) {
        self.stats.record_fail();
        ctx.resume
            .append(&ResumeRecord::new(Operation::Fail, source_id, dest));
    }
}

fn read_or_empty<F>(path: &Path, read: F) -> Tags
where
    F: FnOnce(&Path) -> Result<Tags, crate::metadata::MetadataError>,
{
    match read(path) {
        Ok(tags) => tags,
        Err(e) => {
            debug!("treating tags of {} as empty: {}", path.display(), e);
            Tags::new()
        }
    }
}

/// Merged tags (sidecar wins) that differ from the file's current tags, plus
/// the resolved date in every creation-date tag.
pub fn tag_updates(current: &Tags, sidecar: &Tags, resolved: &NaiveDateTime) -> Tags {
    let mut merged = current.clone();
    merged.extend(sidecar.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut updates: Tags = merged
        .into_iter()
        .filter(|(k, _)| !IGNORED_TAGS.contains(&k.as_str()))
        .filter(|(k, v)| current.get(k) != Some(v))
        .collect();

    let value = format_tag_date(resolved);
    for tag in CREATION_DATE_TAGS {
        updates.insert(tag.to_string(), value.clone());
    }
    updates
}

/// Suffix of in-flight copies in the target tree.
pub const PARTIAL_SUFFIX: &str = ".partial";

enum Claim {
    Copied,
    Taken,
}

/// Copy `src` to `dest` unless something already lives there. The bytes go
/// to a hidden staging file beside `dest`, which is renamed into place without
/// replacing anything, so `dest` never holds a partial copy and concurrent
/// claims for one path have one winner.
fn claim_and_copy(src: &Path, dest: &Path) -> io::Result<Claim> {
    if dest.exists() {
        return Ok(Claim::Taken);
    }
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    // removed on drop unless persisted
    let mut staged = tempfile::Builder::new()
        .prefix(".")
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(parent)?;
    let mut input = File::open(src)?;
    io::copy(&mut input, staged.as_file_mut())?;
    staged.as_file().sync_all()?;

    let mtime = FileTime::from_last_modification_time(&input.metadata()?);
    if let Err(e) = filetime::set_file_mtime(staged.path(), mtime) {
        debug!("cannot preserve mtime on {}: {}", dest.display(), e);
    }

    match staged.persist_noclobber(dest) {
        Ok(_) => Ok(Claim::Copied),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(Claim::Taken),
        Err(e) => Err(e.error),
    }
}

//! Lazy enumeration of media items under the configured sources.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};

use encoding_rs::SHIFT_JIS;
use log::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::media::MediaItem;
use crate::metadata::MetadataService;
use crate::sidecar;

/// Extensions handled regardless of what the metadata tool claims it can read.
pub const FALLBACK_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "gif", "tif", "tiff", "bmp", "aac", "m4a", "mp3", "wav", "wma", "ac3", "dts",
    "aif", "aiff", "asf", "flac", "adp", "dsf", "dff", "l16", "l24", "ogg", "oga", "mpg", "mpeg",
    "vob", "mp4", "m4v", "avi", "mov", "qt", "mts", "m2ts", "mkv",
];

const ARCHIVE_EXTENSION: &str = "zip";

/// Supported-extension predicate, evaluated against the tool once per run.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    supported: HashSet<String>,
}

impl ExtensionFilter {
    pub fn new(service: &dyn MetadataService) -> Self {
        let supported = FALLBACK_EXTENSIONS
            .iter()
            .filter(|ext| service.supports_extension(ext))
            .map(|ext| ext.to_string())
            .collect();
        Self { supported }
    }

    pub fn from_extensions<S: AsRef<str>>(extensions: &[S]) -> Self {
        Self {
            supported: extensions
                .iter()
                .map(|e| e.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.supported.len()
    }

    pub fn is_empty(&self) -> bool {
        self.supported.is_empty()
    }

    pub fn accepts(&self, file_name: &str) -> bool {
        extension_of(file_name).is_some_and(|ext| self.supported.contains(&ext))
    }
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
}

/// Zip entry names: UTF-8 first, then Shift_JIS, then lossy UTF-8.
fn decode_zip_name(raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        return s.to_string();
    }

    let (decoded, _, had_errors) = SHIFT_JIS.decode(raw);
    if !had_errors {
        return decoded.into_owned();
    }

    String::from_utf8_lossy(raw).into_owned()
}

type Walker = walkdir::FilterEntry<walkdir::IntoIter, Box<dyn FnMut(&DirEntry) -> bool + Send>>;

/// Yields one [`MediaItem`] per supported file or archive entry, source by source.
pub struct Enumerator {
    sources: Vec<PathBuf>,
    next_source: usize,
    walker: Option<Walker>,
    pending: VecDeque<MediaItem>,
    filter: ExtensionFilter,
    scratch_root: PathBuf,
}

impl Enumerator {
    pub fn new(sources: &[PathBuf], filter: ExtensionFilter, scratch_root: PathBuf) -> Self {
        let sources = sources
            .iter()
            .map(|s| s.canonicalize().unwrap_or_else(|_| s.clone()))
            .collect();
        Self {
            sources,
            next_source: 0,
            walker: None,
            pending: VecDeque::new(),
            filter,
            scratch_root,
        }
    }

    fn start_next_source(&mut self) -> bool {
        let Some(root) = self.sources.get(self.next_source).cloned() else {
            return false;
        };
        self.next_source += 1;

        if root.is_file() {
            self.push_file(root);
            return true;
        }

        let others: Vec<PathBuf> = self
            .sources
            .iter()
            .filter(|s| **s != root)
            .cloned()
            .collect();
        let skip_other_sources: Box<dyn FnMut(&DirEntry) -> bool + Send> =
            Box::new(move |entry: &DirEntry| {
                !(entry.depth() > 0
                    && entry.file_type().is_dir()
                    && others.iter().any(|o| o == entry.path()))
            });
        self.walker = Some(WalkDir::new(&root).into_iter().filter_entry(skip_other_sources));
        true
    }

    fn push_file(&mut self, path: PathBuf) {
        if is_archive(&path) {
            self.push_archive(&path);
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.filter.accepts(n))
        {
            self.pending.push_back(MediaItem::from_file(path));
        }
    }

    /// List an archive's supported entries without extracting anything.
    fn push_archive(&mut self, path: &Path) {
        let mut archive = match File::open(path)
            .map_err(zip::result::ZipError::from)
            .and_then(zip::ZipArchive::new)
        {
            Ok(archive) => archive,
            Err(e) => {
                warn!("skipping unreadable archive {}: {}", path.display(), e);
                return;
            }
        };

        let mut names: Vec<Option<String>> = Vec::with_capacity(archive.len());
        let mut by_name: HashMap<String, usize> = HashMap::with_capacity(archive.len());
        for index in 0..archive.len() {
            match archive.by_index_raw(index) {
                Ok(entry) if !entry.is_dir() => {
                    let name = decode_zip_name(entry.name_raw());
                    by_name.insert(name.clone(), index);
                    names.push(Some(name));
                }
                Ok(_) => names.push(None),
                Err(e) => {
                    warn!("skipping entry {} of {}: {}", index, path.display(), e);
                    names.push(None);
                }
            }
        }

        let before = self.pending.len();
        for (index, name) in names.into_iter().enumerate() {
            let Some(name) = name else { continue };
            let file_name = name.rsplit('/').next().unwrap_or(&name);
            if file_name.is_empty() || !self.filter.accepts(file_name) {
                continue;
            }
            let sidecar_index = sidecar::find_in_entries(&name, |k| by_name.get(k));
            self.pending.push_back(MediaItem::from_archive_entry(
                path.to_path_buf(),
                index,
                name,
                sidecar_index,
                self.scratch_root.clone(),
            ));
        }
        debug!(
            "{}: {} media entries",
            path.display(),
            self.pending.len() - before
        );
    }
}

impl Iterator for Enumerator {
    type Item = MediaItem;

    fn next(&mut self) -> Option<MediaItem> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }

            let Some(walker) = self.walker.as_mut() else {
                if !self.start_next_source() {
                    return None;
                }
                continue;
            };

            match walker.next() {
                Some(Ok(entry)) => {
                    if entry.file_type().is_file() {
                        self.push_file(entry.into_path());
                    }
                }
                Some(Err(e)) => warn!("skipping unreadable path: {}", e),
                None => self.walker = None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn filter() -> ExtensionFilter {
        ExtensionFilter::from_extensions(&["jpg", "mp4"])
    }

    fn identities(items: Vec<MediaItem>) -> Vec<String> {
        let mut ids: Vec<String> = items
            .iter()
            .map(|i| i.original_source().to_string())
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_decode_zip_name_fallbacks() {
        assert_eq!(decode_zip_name("写真.jpg".as_bytes()), "写真.jpg");
        let (sjis, _, _) = SHIFT_JIS.encode("写真.jpg");
        assert_eq!(decode_zip_name(&sjis), "写真.jpg");
    }

    #[test]
    fn test_filter_by_extension() {
        let f = filter();
        assert!(f.accepts("a.JPG"));
        assert!(f.accepts("clip.mp4"));
        assert!(!f.accepts("a.jpg.json"));
        assert!(!f.accepts("README"));
    }

    #[test]
    fn test_walks_directories_and_skips_nested_sources() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let a = root.join("a");
        let nested = a.join("nested");
        fs::create_dir_all(&nested).unwrap();
        fs::write(a.join("1.jpg"), b"x").unwrap();
        fs::write(a.join("1.jpg.json"), b"{}").unwrap();
        fs::write(a.join("notes.txt"), b"x").unwrap();
        fs::write(nested.join("2.mp4"), b"x").unwrap();

        let items: Vec<MediaItem> =
            Enumerator::new(&[a.clone(), nested.clone()], filter(), root.join("tmp")).collect();
        assert_eq!(
            identities(items),
            vec![
                a.join("1.jpg").to_string_lossy().into_owned(),
                nested.join("2.mp4").to_string_lossy().into_owned(),
            ]
        );
    }

    #[test]
    fn test_archive_entries_become_items() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let archive = root.join("takeout.zip");
        let mut writer = zip::ZipWriter::new(File::create(&archive).unwrap());
        let options = SimpleFileOptions::default();
        writer.add_directory("Photos/", options).unwrap();
        for name in ["Photos/a.jpg", "Photos/a.jpg.json", "Photos/b.mp4", "Photos/c.txt"] {
            writer.start_file(name, options).unwrap();
            writer.write_all(b"x").unwrap();
        }
        writer.finish().unwrap();

        let items: Vec<MediaItem> =
            Enumerator::new(&[root.clone()], filter(), root.join("tmp")).collect();
        assert_eq!(items.len(), 2);

        let a = items
            .iter()
            .find(|i| i.file_name() == "a.jpg")
            .expect("a.jpg listed");
        match a.source() {
            crate::media::MediaSource::Archived { sidecar_index, .. } => {
                assert!(sidecar_index.is_some())
            }
            other => panic!("unexpected source {:?}", other),
        }
        assert!(!a.is_materialized());
    }

    #[test]
    fn test_single_file_source_and_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let single = root.join("one.jpg");
        fs::write(&single, b"x").unwrap();
        let broken = root.join("broken.zip");
        fs::write(&broken, b"not a zip").unwrap();

        let items: Vec<MediaItem> =
            Enumerator::new(&[single.clone(), broken], filter(), root.join("tmp")).collect();
        assert_eq!(identities(items), vec![single.to_string_lossy().into_owned()]);
    }
}

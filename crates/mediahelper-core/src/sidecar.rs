//! Locating the JSON sidecar that belongs to a media file.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

/// Longest sidecar file name Google Takeout writes, `.json` included.
const MAX_SIDECAR_NAME_LEN: usize = 51;

static BRACKET_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(\d+\)\.").unwrap());

/// Sidecar names to try for `file_name`, most likely first, without duplicates.
pub fn candidate_names(file_name: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(4);
    for base in [
        file_name.to_string(),
        shorten_name(file_name),
        bracket_swap(file_name),
        no_extension(file_name),
    ] {
        let name = format!("{}.json", base);
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// First existing sidecar next to `media`.
pub fn find_beside(media: &Path) -> Option<PathBuf> {
    let dir = media.parent()?;
    let file_name = media.file_name()?.to_str()?;
    candidate_names(file_name)
        .into_iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// First sidecar among archive entry names. `entry_name` uses `/` separators.
pub fn find_in_entries<'a, F>(entry_name: &str, mut lookup: F) -> Option<usize>
where
    F: FnMut(&str) -> Option<&'a usize>,
{
    let (dir, file_name) = match entry_name.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, entry_name),
    };
    candidate_names(file_name).into_iter().find_map(|name| {
        let full = match dir {
            Some(dir) => format!("{}/{}", dir, name),
            None => name,
        };
        lookup(&full).copied()
    })
}

fn shorten_name(file_name: &str) -> String {
    let max_len = MAX_SIDECAR_NAME_LEN - ".json".len();
    if file_name.len() + ".json".len() > MAX_SIDECAR_NAME_LEN {
        let mut end = max_len;
        while end > 0 && !file_name.is_char_boundary(end) {
            end -= 1;
        }
        file_name[..end].to_string()
    } else {
        file_name.to_string()
    }
}

/// `img(1).jpg` -> `img.jpg(1)`
fn bracket_swap(file_name: &str) -> String {
    if let Some(m) = BRACKET_RE.find_iter(file_name).last() {
        let bracket = m.as_str().replace('.', "");
        if let Some(pos) = file_name.rfind(&bracket) {
            let mut result = String::with_capacity(file_name.len());
            result.push_str(&file_name[..pos]);
            result.push_str(&file_name[pos + bracket.len()..]);
            result.push_str(&bracket);
            return result;
        }
    }
    file_name.to_string()
}

fn no_extension(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name)
        .to_string()
}

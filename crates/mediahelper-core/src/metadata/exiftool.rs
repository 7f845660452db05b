//! `exiftool` driven in `-stay_open` mode: one long-lived process per worker,
//! commands written to its stdin, replies read up to the `{ready}` sentinel.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use log::{debug, warn};

use super::{sidecar_tags, MetadataClient, MetadataError, MetadataService, Tags};

const READY_SENTINEL: &str = "{ready}";

/// Run-wide exiftool facts, gathered once.
pub struct ExifToolService {
    path: PathBuf,
    version: String,
    extensions: HashSet<String>,
    fix_offsets: bool,
}

impl ExifToolService {
    /// `fix_offsets` makes every write pass `-F` so exiftool repairs broken
    /// maker-note offsets.
    pub fn new(path: &Path, fix_offsets: bool) -> Result<Self, MetadataError> {
        let version = run_once(path, &["-ver"])?.trim().to_string();
        let extensions = parse_extension_list(&run_once(path, &["-listf"])?);
        debug!(
            "exiftool {} at {} supports {} extensions",
            version,
            path.display(),
            extensions.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            version,
            extensions,
            fix_offsets,
        })
    }
}

impl MetadataService for ExifToolService {
    fn tool_version(&self) -> &str {
        &self.version
    }

    fn supports_extension(&self, ext: &str) -> bool {
        self.extensions.contains(ext)
    }

    fn open_client(&self) -> Result<Box<dyn MetadataClient>, MetadataError> {
        Ok(Box::new(ExifToolClient::spawn(&self.path, self.fix_offsets)?))
    }
}

fn run_once(path: &Path, args: &[&str]) -> Result<String, MetadataError> {
    let output = Command::new(path).args(args).output().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MetadataError::ToolMissing(path.to_path_buf())
        } else {
            MetadataError::Io(e)
        }
    })?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `Supported file extensions:\n  3FR 3G2 ...` -> {"3fr", "3g2", ...}
fn parse_extension_list(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter(|line| !line.trim_end().ends_with(':'))
        .flat_map(|line| line.split_whitespace())
        .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

/// One stay-open exiftool process. The process is told to exit when the client is dropped.
pub struct ExifToolClient {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
    fix_offsets: bool,
}

impl ExifToolClient {
    pub fn spawn(path: &Path, fix_offsets: bool) -> Result<Self, MetadataError> {
        let mut child = Command::new(path)
            .args(["-stay_open", "True", "-@", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MetadataError::ToolMissing(path.to_path_buf())
                } else {
                    MetadataError::Io(e)
                }
            })?;
        let stdin = child.stdin.take().ok_or(MetadataError::ToolExited)?;
        let stdout = child.stdout.take().ok_or(MetadataError::ToolExited)?;
        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stdout: BufReader::new(stdout),
            fix_offsets,
        })
    }

    /// Send one command and collect its output lines.
    fn execute<S: AsRef<str>>(&mut self, args: &[S]) -> Result<Vec<String>, MetadataError> {
        check_args(args)?;
        let stdin = self.stdin.as_mut().ok_or(MetadataError::ToolExited)?;
        for arg in args {
            writeln!(stdin, "{}", arg.as_ref())?;
        }
        writeln!(stdin, "-execute")?;
        stdin.flush()?;

        let mut lines = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            if self.stdout.read_line(&mut line)? == 0 {
                return Err(MetadataError::ToolExited);
            }
            let trimmed = line.trim_end();
            if trimmed.starts_with(READY_SENTINEL) {
                return Ok(lines);
            }
            lines.push(trimmed.to_string());
        }
    }
}

/// The `-@ -` argument file is line-based; a line break inside an argument
/// would split it into separate options.
fn check_args<S: AsRef<str>>(args: &[S]) -> Result<(), MetadataError> {
    for arg in args {
        let arg = arg.as_ref();
        if arg.contains(['\n', '\r']) {
            return Err(MetadataError::UnsafeArgument(arg.to_string()));
        }
    }
    Ok(())
}

fn write_args(path: &Path, tags: &Tags, fix_offsets: bool) -> Vec<String> {
    let mut args: Vec<String> = vec!["-overwrite_original".into(), "-m".into()];
    if fix_offsets {
        args.push("-F".into());
    }
    args.extend(tags.iter().map(|(k, v)| format!("-{}={}", k, v)));
    args.push(path.to_string_lossy().into_owned());
    args
}

/// `FileModifyDate                  : 2023:08:15 13:45:01+03:00`
fn parse_short_tags(lines: &[String]) -> Tags {
    let mut tags = Tags::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if key.is_empty() || key.contains(' ') {
                continue;
            }
            tags.entry(key.to_string())
                .or_insert_with(|| value.trim().to_string());
        }
    }
    tags
}

/// Success means at least one file updated and none failed.
fn write_succeeded(lines: &[String]) -> bool {
    let mut updated = 0u64;
    for line in lines {
        let line = line.trim();
        if line.contains("weren't updated due to errors") {
            return false;
        }
        if line.ends_with("files updated") {
            updated += line
                .split_whitespace()
                .next()
                .and_then(|n| n.parse::<u64>().ok())
                .unwrap_or(0);
        }
    }
    updated > 0
}

impl MetadataClient for ExifToolClient {
    fn read_tags(&mut self, path: &Path) -> Result<Tags, MetadataError> {
        let path = path.to_string_lossy();
        let lines = self.execute(&["-s", path.as_ref()])?;
        Ok(parse_short_tags(&lines))
    }

    fn read_sidecar_tags(&mut self, path: &Path) -> Result<Tags, MetadataError> {
        let flat = self.read_tags(path)?;
        Ok(sidecar_tags::translate(&flat))
    }

    fn try_write_tags(&mut self, path: &Path, tags: &Tags) -> bool {
        let args = write_args(path, tags, self.fix_offsets);
        match self.execute(&args) {
            Ok(lines) => write_succeeded(&lines),
            Err(e) => {
                warn!("exiftool write failed for {}: {}", path.display(), e);
                false
            }
        }
    }
}

impl Drop for ExifToolClient {
    fn drop(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = writeln!(stdin, "-stay_open\nFalse");
            let _ = stdin.flush();
        }
        if self.child.wait().is_err() {
            let _ = self.child.kill();
        }
    }
}

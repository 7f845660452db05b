use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error};

use super::{ResumeError, ResumeRecord};

const LOG_EXTENSION: &str = "log";
const MIN_SAVE_DELAY: Duration = Duration::from_millis(10);

enum Command {
    Record(String),
    Flush(Sender<()>),
    Shutdown,
}

/// Append-only log for one run. A single flusher thread owns the file and
/// writes pending records at most once per save window, on [`flush`], and
/// when the log is dropped.
///
/// [`flush`]: ResumeLog::flush
pub struct ResumeLog {
    path: PathBuf,
    tx: Sender<Command>,
    flusher: Option<JoinHandle<()>>,
}

impl ResumeLog {
    /// Create `<root>/<yyyyMMddHHmmss>.log`, or a `-N` variant if that name is taken.
    pub fn create(root: &Path, save_delay: Duration) -> Result<Self, ResumeError> {
        let create_err = |source| ResumeError::Create {
            path: root.to_path_buf(),
            source,
        };
        fs::create_dir_all(root).map_err(create_err)?;

        let stamp = Local::now().format("%Y%m%d%H%M%S").to_string();
        let mut attempt = 0u32;
        let (path, file) = loop {
            let name = if attempt == 0 {
                format!("{}.{}", stamp, LOG_EXTENSION)
            } else {
                format!("{}-{}.{}", stamp, attempt, LOG_EXTENSION)
            };
            let path = root.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(create_err(e)),
            }
        };

        let (tx, rx) = crossbeam_channel::unbounded();
        let thread_path = path.clone();
        let flusher = std::thread::Builder::new()
            .name("resume-log".into())
            .spawn(move || run_flusher(rx, file, thread_path, save_delay))
            .map_err(create_err)?;

        debug!("resume log: {}", path.display());
        Ok(Self {
            path,
            tx,
            flusher: Some(flusher),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A cheap, cloneable appender for one worker.
    pub fn handle(&self) -> ResumeHandle {
        ResumeHandle {
            tx: Some(self.tx.clone()),
        }
    }

    pub fn append(&self, record: &ResumeRecord) {
        self.handle().append(record);
    }

    /// Write everything appended so far and wait until it is on disk.
    pub fn flush(&self) -> Result<(), ResumeError> {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(Command::Flush(ack_tx))
            .map_err(|_| ResumeError::Closed)?;
        ack_rx.recv().map_err(|_| ResumeError::Closed)
    }
}

impl Drop for ResumeLog {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(flusher) = self.flusher.take() {
            if flusher.join().is_err() {
                error!("resume log writer panicked: {}", self.path.display());
            }
        }
    }
}

/// Per-worker appender. A disabled handle drops every record.
#[derive(Clone, Default)]
pub struct ResumeHandle {
    tx: Option<Sender<Command>>,
}

impl ResumeHandle {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Fire-and-forget; never blocks on I/O.
    pub fn append(&self, record: &ResumeRecord) {
        if let Some(tx) = &self.tx {
            if tx.send(Command::Record(record.to_line())).is_err() {
                debug!("resume log closed, dropping record for {}", record.source);
            }
        }
    }
}

fn run_flusher(rx: Receiver<Command>, file: File, path: PathBuf, save_delay: Duration) {
    let save_delay = save_delay.max(MIN_SAVE_DELAY);
    let mut writer = BufWriter::new(file);
    let mut pending: Vec<String> = Vec::new();
    let mut last_write = Instant::now();

    loop {
        if !pending.is_empty() && last_write.elapsed() >= save_delay {
            write_pending(&mut writer, &mut pending, &path);
            last_write = Instant::now();
        }

        let wait = save_delay.saturating_sub(last_write.elapsed());
        match rx.recv_timeout(wait) {
            Ok(Command::Record(line)) => pending.push(line),
            Ok(Command::Flush(ack)) => {
                write_pending(&mut writer, &mut pending, &path);
                last_write = Instant::now();
                let _ = ack.send(());
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !pending.is_empty() {
                    write_pending(&mut writer, &mut pending, &path);
                }
                last_write = Instant::now();
            }
        }
    }

    // Records still queued behind the shutdown request.
    pending.extend(rx.try_iter().filter_map(|cmd| match cmd {
        Command::Record(line) => Some(line),
        _ => None,
    }));
    write_pending(&mut writer, &mut pending, &path);
}

fn write_pending(writer: &mut BufWriter<File>, pending: &mut Vec<String>, path: &Path) {
    if pending.is_empty() {
        return;
    }
    let result = pending
        .iter()
        .try_for_each(|line| writeln!(writer, "{}", line))
        .and_then(|_| writer.flush());
    match result {
        Ok(()) => pending.clear(),
        Err(e) => error!("cannot write resume log {}: {}", path.display(), e),
    }
}

/// Replay every `.log` file under `root`, oldest name first. Any line that
/// does not parse makes the whole replay fail.
pub fn read_all(root: &Path) -> Result<Vec<ResumeRecord>, ResumeError> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let read_err = |path: &Path, source| ResumeError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut files: Vec<PathBuf> = fs::read_dir(root)
        .map_err(|e| read_err(root, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == LOG_EXTENSION))
        .collect();
    files.sort();

    let mut records = Vec::new();
    for path in files {
        let bytes = fs::read(&path).map_err(|e| read_err(&path, e))?;
        let text = String::from_utf8(bytes).map_err(|e| {
            let valid = &e.as_bytes()[..e.utf8_error().valid_up_to()];
            ResumeError::Corrupt {
                path: path.clone(),
                line: valid.iter().filter(|b| **b == b'\n').count() + 1,
            }
        })?;
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = ResumeRecord::parse_line(line).ok_or_else(|| ResumeError::Corrupt {
                path: path.clone(),
                line: index + 1,
            })?;
            records.push(record);
        }
    }
    Ok(records)
}

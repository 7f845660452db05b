pub mod cancel;
pub mod cleanup;
pub mod date;
pub mod media;
pub mod metadata;
pub mod placement;
pub mod resume;
pub mod scan;
pub mod scheduler;
pub mod settings;
pub mod sidecar;
pub mod stats;
pub mod throttle;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::date::DateResolver;
use crate::metadata::MetadataService;
use crate::placement::{Outcome, PlacementError, Placer, WorkerContext};
use crate::resume::{ResumeFilter, ResumeHandle, ResumeLog};
use crate::scan::{Enumerator, ExtensionFilter};
use crate::scheduler::Scheduler;

pub use cancel::{CancellationToken, CancelledError};
pub use settings::{Settings, SettingsError};
pub use stats::{Statistics, StatisticsSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    /// Items handed to workers (skipped items excluded).
    pub total: u64,
    pub processed: u64,
    pub statistics: StatisticsSnapshot,
    #[serde(default)]
    pub removed_directories: u64,
    pub tool_version: String,
    #[serde(default)]
    pub watcher_version: Option<String>,
    #[serde(default)]
    pub resume_log: Option<PathBuf>,
    pub elapsed_ms: u64,
}

/// Control options for process execution.
#[derive(Debug, Clone, Default)]
pub struct ProcessControl {
    /// Cancellation token for Ctrl-C support.
    pub cancel_token: Option<CancellationToken>,
}

impl ProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

/// `(processed, total, statistics)`
pub type ProgressCallback = dyn Fn(u64, u64, &StatisticsSnapshot) + Send + Sync;

/// Run the full pipeline with progress reporting.
pub fn process(
    settings: &Settings,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<ProcessResult> {
    process_with_control(settings, &ProcessControl::default(), progress_callback)
}

/// Run the full pipeline with the metadata backend named in the settings.
pub fn process_with_control(
    settings: &Settings,
    control: &ProcessControl,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<ProcessResult> {
    settings.validate()?;
    let service = metadata::open_service(
        settings.metadata_backend,
        &settings.exif_tool_path,
        settings.attempt_to_fix_incorrect_offsets,
    )
        .context("cannot start metadata backend")?;
    process_with_service(settings, service.as_ref(), control, progress_callback)
}

/// Run the full pipeline against an already constructed metadata service.
pub fn process_with_service(
    settings: &Settings,
    service: &dyn MetadataService,
    control: &ProcessControl,
    progress_callback: &ProgressCallback,
) -> anyhow::Result<ProcessResult> {
    let started = Instant::now();
    let cancel = control.cancel_token.clone().unwrap_or_default();
    cancel.check()?;

    let target = settings.validate()?;
    let resolver = DateResolver::new(&settings.filename_denylist)?;
    let workers = settings.effective_workers();
    info!(
        "metadata tool {}, {} worker(s), target {}",
        service.tool_version(),
        workers,
        target.display()
    );
    if let Some(watcher) = service.watcher_version() {
        info!("tool watcher {}", watcher);
    }

    // Prior runs are replayed before anything is scheduled; a corrupt log stops here.
    let log_dir = settings.log_directory(target);
    let records = if settings.enable_log_and_resume {
        resume::read_all(&log_dir)?
    } else {
        Vec::new()
    };
    let filter = ResumeFilter::new(&settings.ignores, &records);
    if filter.completed_len() > 0 {
        info!("resuming: {} source(s) already placed", filter.completed_len());
    }
    drop(records);

    let resume_log = if settings.enable_log_and_resume {
        Some(ResumeLog::create(&log_dir, settings.log_save_delay())?)
    } else {
        None
    };

    std::fs::create_dir_all(target)
        .with_context(|| format!("cannot create target {}", target.display()))?;

    let extensions = ExtensionFilter::new(service);
    if extensions.is_empty() {
        warn!("the metadata tool supports none of the known media extensions");
    }
    debug!("{} supported extension(s)", extensions.len());

    let stats = Statistics::new();
    let items = Enumerator::new(&settings.sources, extensions, settings.temp_directory())
        .filter(|item| {
            let keep = filter.needs_processing(item.original_source());
            if !keep {
                stats.record_skip();
                debug!("skipping {}", item.original_source());
            }
            keep
        });

    let placer = Placer {
        resolver: &resolver,
        stats: &stats,
        target,
        fix_localized_digits: settings.auto_fix_arabic_numbers_in_file_name,
    };

    let totals = Scheduler::new(workers, settings.progress_interval()).run(
        items,
        |item, _, ctx: &mut WorkerContext| log_outcome(placer.process(item, ctx)),
        |_| -> Result<WorkerContext, metadata::MetadataError> {
            Ok(WorkerContext {
                client: service.open_client()?,
                resume: resume_log
                    .as_ref()
                    .map(ResumeLog::handle)
                    .unwrap_or_else(ResumeHandle::disabled),
            })
        },
        |processed, total| progress_callback(processed, total, &stats.snapshot()),
        &cancel,
    )
    .context("cannot open a metadata client for every worker")?;

    if let Some(log) = &resume_log {
        log.flush()?;
    }
    let resume_log_path = resume_log.as_ref().map(|log| log.path().to_path_buf());
    drop(resume_log);

    if cancel.is_cancelled() {
        return Err(CancelledError.into());
    }

    let removed_directories = if settings.delete_empty_directories_on_complete {
        let mut roots: Vec<PathBuf> = settings
            .sources
            .iter()
            .filter(|s| s.is_dir())
            .cloned()
            .collect();
        roots.push(target.to_path_buf());
        cleanup::delete_empty_directories(&roots)
    } else {
        0
    };

    Ok(ProcessResult {
        total: totals.total,
        processed: totals.processed,
        statistics: stats.snapshot(),
        removed_directories,
        tool_version: service.tool_version().to_string(),
        watcher_version: service.watcher_version().map(str::to_string),
        resume_log: resume_log_path,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

fn log_outcome(outcome: Outcome) {
    match outcome {
        Outcome::Updated(dest) => debug!("placed {}", dest.display()),
        Outcome::Duplicate(dest) => debug!("duplicate of {}", dest.display()),
        Outcome::Failed(e @ PlacementError::Unresolvable(_)) => debug!("{}", e),
        Outcome::Failed(e) => warn!("{}", e),
    }
}

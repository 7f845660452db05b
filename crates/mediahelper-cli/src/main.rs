use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use mediahelper_core::metadata::Backend;
use mediahelper_core::{CancellationToken, CancelledError, ProcessControl, Settings};

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    /// exiftool in stay-open mode
    Exiftool,
    /// Built-in EXIF reader (writes file timestamps only)
    Native,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Exiftool => Backend::Exiftool,
            BackendArg::Native => Backend::Native,
        }
    }
}

#[derive(Parser)]
#[command(name = "mediahelper", version, about = "Copy photos and videos into Year/Month folders by capture date")]
struct Cli {
    /// Settings file (appsettings.json layout); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source directory or archive (repeatable)
    #[arg(short, long = "source")]
    sources: Vec<PathBuf>,

    /// Target directory
    #[arg(short, long)]
    target: Option<PathBuf>,

    /// Skip sources containing this text, case-insensitive (repeatable)
    #[arg(long = "ignore")]
    ignores: Vec<String>,

    /// Number of workers
    #[arg(long)]
    tasks: Option<i64>,

    /// Do not cap the worker count by the CPU count
    #[arg(long)]
    super_user: bool,

    /// Neither read nor write the resume log
    #[arg(long)]
    no_resume: bool,

    /// Remove empty directories from sources and target when done
    #[arg(long)]
    delete_empty_dirs: bool,

    /// Metadata backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Path to the exiftool executable
    #[arg(long)]
    exiftool: Option<PathBuf>,

    /// Let exiftool repair broken maker-note offsets when writing
    #[arg(long)]
    fix_offsets: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn settings(self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        if !self.sources.is_empty() {
            settings.sources = self.sources;
        }
        if self.target.is_some() {
            settings.target = self.target;
        }
        settings.ignores.extend(self.ignores);
        if let Some(tasks) = self.tasks {
            settings.tasks_count = tasks;
        }
        settings.enable_super_user_mode |= self.super_user;
        if self.no_resume {
            settings.enable_log_and_resume = false;
        }
        settings.delete_empty_directories_on_complete |= self.delete_empty_dirs;
        if let Some(backend) = self.backend {
            settings.metadata_backend = backend.into();
        }
        if let Some(path) = self.exiftool {
            settings.exif_tool_path = path;
        }
        settings.attempt_to_fix_incorrect_offsets |= self.fix_offsets;
        Ok(settings)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let settings = cli.settings()?;
    let t_total = std::time::Instant::now();

    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling, waiting for in-flight items...");
        handler_token.cancel();
    })?;
    let control = ProcessControl::new().with_cancel_token(token);

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40}] {pos}/{len} {msg}")
            .unwrap(),
    );
    let bar = pb.clone();

    let result = mediahelper_core::process_with_control(&settings, &control, &move |processed, total, stats| {
        bar.set_length(total);
        bar.set_position(processed);
        bar.set_message(format!(
            "copied {} updated {} duplicates {} failed {}",
            stats.copies, stats.updates, stats.duplicates, stats.fails
        ));
    });
    pb.finish_and_clear();

    let result = match result {
        Ok(result) => result,
        Err(e) if e.downcast_ref::<CancelledError>().is_some() => {
            eprintln!("Cancelled after {:.2}s", t_total.elapsed().as_secs_f64());
            std::process::exit(130);
        }
        Err(e) => return Err(e),
    };

    let stats = result.statistics;
    eprintln!(
        "Done! {} of {} items: {} copied, {} updated, {} duplicates, {} skipped, {} failed ({:.2}s)",
        result.processed,
        result.total,
        stats.copies,
        stats.updates,
        stats.duplicates,
        stats.skipped,
        stats.fails,
        t_total.elapsed().as_secs_f64()
    );
    if result.removed_directories > 0 {
        eprintln!("Removed {} empty directories", result.removed_directories);
    }
    if let Some(log) = &result.resume_log {
        eprintln!("Resume log: {}", log.display());
    }

    Ok(())
}

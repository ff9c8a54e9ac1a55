//! Process logging and per-job log files.
//!
//! Process logs go to stderr (stdout is reserved for the JSON job report),
//! optionally mirrored to a daily-rolling file. Each job additionally writes a
//! plain-text [`JobLog`] that is published when the job ends.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    pub verbose: bool,
    pub format: LogFormat,
    /// Directory for a daily-rolling JSON log file.
    pub file_dir: Option<PathBuf>,
}

/// Install the global subscriber. `RUST_LOG` wins over `--verbose`.
///
/// The returned guard must be held for the life of the process when a log
/// file is configured, or buffered lines are lost.
pub fn init_tracing(opts: &LoggingOptions) -> Result<Option<WorkerGuard>> {
    let default_level = if opts.verbose { "debug" } else { "info" };
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(format!(
            "slipway={default_level},bollard=warn,hyper=warn,reqwest=warn"
        )),
    };

    let stderr_layer = match opts.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Text => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = match &opts.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "slipway.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// Timestamped, stage-tagged log of one job.
///
/// Every line is also emitted through `tracing` at info level. Write failures
/// are reported through `tracing` and otherwise ignored: a broken job log
/// never fails the job.
#[derive(Debug)]
pub struct JobLog {
    path: PathBuf,
    resource_uuid: String,
    file: Mutex<File>,
}

impl JobLog {
    /// Create `<log_dir>/<resource_uuid>-<job_id>.log`.
    pub fn create(log_dir: &Path, resource_uuid: &str, job_id: &str) -> Result<Self> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let path = log_dir.join(format!("{}-{}.log", resource_uuid, job_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open job log {}", path.display()))?;
        Ok(Self {
            path,
            resource_uuid: resource_uuid.to_string(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resource_uuid(&self) -> &str {
        &self.resource_uuid
    }

    pub fn line(&self, stage: &str, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::info!(resource = %self.resource_uuid, stage, "{}", msg);
        self.write(stage, msg);
    }

    pub fn error(&self, stage: &str, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::error!(resource = %self.resource_uuid, stage, "{}", msg);
        self.write(stage, &format!("ERROR {}", msg));
    }

    /// Append multi-line tool output without mirroring each line to tracing.
    pub fn output(&self, stage: &str, text: &str) {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.write(stage, line);
        }
    }

    fn write(&self, stage: &str, msg: &str) {
        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let result = match self.file.lock() {
            Ok(mut f) => writeln!(f, "{} [{}] {}", stamp, stage, msg),
            Err(_) => return,
        };
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "job log write failed");
        }
    }
}

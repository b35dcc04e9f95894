//! Terminal and file logging for a converter run.
//!
//! Each run gets its own directory holding the log and a snapshot of the
//! converter setup it ran with:
//! ```text
//! <root>/<run_name>/converter.log
//! <root>/<run_name>/converter.json
//! ```
//! The library itself only emits `tracing` events; nothing is recorded until
//! the host calls [`start_run`].

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

use crate::controller::ConverterConfig;

pub const LOG_FILE: &str = "converter.log";
pub const CONFIG_SNAPSHOT: &str = "converter.json";

type FileLayer = fmt::Layer<
    Registry,
    fmt::format::DefaultFields,
    fmt::format::Format<fmt::format::Full, fmt::time::ChronoUtc>,
    NonBlocking,
>;

static SINKS: OnceLock<Sinks> = OnceLock::new();

/// Where and how verbosely a run is logged
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    /// Directory that run directories are created under
    pub root: PathBuf,

    pub run_name: String,

    /// Filter directive used when `RUST_LOG` is not set, e.g. `"easyboost=debug"`
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("easyboost"),
            run_name: default_run_name(),
            level: "info".to_owned(),
        }
    }
}

impl LogSettings {
    /// Timestamped run under `root`
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(&self.run_name)
    }
}

/// Files belonging to a started run
#[derive(Clone, Debug, PartialEq)]
pub struct RunLog {
    pub run_dir: PathBuf,
    pub log_path: PathBuf,
    pub config_path: PathBuf,
}

/// Writer threads of the installed subscriber. Kept for the life of the
/// process; pending lines are flushed when the guards drop.
struct Sinks {
    _terminal: Mutex<WorkerGuard>,
    file: Mutex<WorkerGuard>,
    retarget: reload::Handle<FileLayer, Registry>,
}

impl Sinks {
    fn install(logfile: File, level: &str) -> Result<Self, String> {
        let (terminal_writer, terminal_guard) = tracing_appender::non_blocking(std::io::stdout());
        let (file_writer, file_guard) = tracing_appender::non_blocking(logfile);

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .map_err(|e| format!("Invalid log level {level:?}: {e}"))?;

        let terminal = fmt::layer()
            .with_timer(fmt::time::ChronoUtc::rfc_3339())
            .with_writer(terminal_writer)
            .with_target(false);
        let (file, retarget) = reload::Layer::<FileLayer, Registry>::new(file_layer(file_writer));

        tracing_subscriber::registry()
            .with(file)
            .with(filter)
            .with(terminal)
            .try_init()
            .map_err(|e| format!("Failed to install log subscriber: {e}"))?;

        Ok(Self {
            _terminal: Mutex::new(terminal_guard),
            file: Mutex::new(file_guard),
            retarget,
        })
    }

    /// Move file output to the log of a new run. The level filter stays as installed.
    fn retarget(&self, logfile: File) -> Result<(), String> {
        let (writer, guard) = tracing_appender::non_blocking(logfile);
        let mut current = self
            .file
            .lock()
            .map_err(|_| "Log file guard lock poisoned".to_string())?;
        self.retarget
            .modify(|layer| *layer = file_layer(writer))
            .map_err(|e| format!("Failed to move log file: {e}"))?;
        *current = guard;
        Ok(())
    }
}

fn file_layer(writer: NonBlocking) -> FileLayer {
    fmt::layer::<Registry>()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(writer)
        .with_ansi(false)
}

/// Run name from the current UTC time, without the `:` that Windows
/// rejects in file names
pub fn default_run_name() -> String {
    DateTime::<Utc>::from(SystemTime::now())
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        .replace(':', "")
}

/// Create the run directory, snapshot `config` into it and send
/// logging there, installing the terminal and file subscriber on first use.
pub fn start_run(settings: &LogSettings, config: &ConverterConfig) -> Result<RunLog, String> {
    let run_dir = settings.run_dir();
    fs::create_dir_all(&run_dir)
        .map_err(|e| format!("Failed to create run directory {}: {e}", run_dir.display()))?;

    let config_path = run_dir.join(CONFIG_SNAPSHOT);
    fs::write(&config_path, config.to_json()?)
        .map_err(|e| format!("Failed to write {}: {e}", config_path.display()))?;

    let log_path = run_dir.join(LOG_FILE);
    let logfile = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to open {}: {e}", log_path.display()))?;

    match SINKS.get() {
        Some(sinks) => sinks.retarget(logfile)?,
        None => {
            let sinks = Sinks::install(logfile, &settings.level)?;
            // Only the first caller can get here; try_init rejects a second subscriber
            let _ = SINKS.set(sinks);
        }
    }

    info!(
        "Run {} started: output pin {:?}, set point {:?} V, PWM {:?} Hz",
        settings.run_name, config.pwm_pin, config.set_point, config.pwm_frequency_hz
    );

    Ok(RunLog {
        run_dir,
        log_path,
        config_path,
    })
}

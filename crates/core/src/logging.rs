//! Filter selection and file sink setup for the `tracing` subscriber the app installs.

use std::{fs, path::PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "framebridge";
const LOG_FILE_SUFFIX: &str = "log";

/// ONNX Runtime is chatty at `info`. The console hears warnings only, the file keeps everything.
const CONSOLE_RUNTIME_DIRECTIVE: &str = "ort=warn";
const FILE_RUNTIME_DIRECTIVE: &str = "ort=info";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    /// Zero keeps the default.
    pub retention_files: usize,
}

/// Where the user-facing part of the filter came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSource {
    Cli(String),
    Verbose(u8),
    Env(String),
    Default,
}

impl FilterSource {
    /// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then the default.
    pub fn select(settings: &LogSettings) -> Self {
        if let Some(filter) = &settings.cli_log_filter {
            Self::Cli(filter.clone())
        } else if settings.verbose > 0 {
            Self::Verbose(settings.verbose)
        } else if let Some(filter) = &settings.rust_log_env {
            Self::Env(filter.clone())
        } else {
            Self::Default
        }
    }

    /// The user picked this filter on the command line.
    fn is_explicit(&self) -> bool {
        matches!(self, Self::Cli(_) | Self::Verbose(_))
    }

    fn directive(&self) -> &str {
        match self {
            Self::Cli(filter) | Self::Env(filter) => filter,
            Self::Verbose(1) => "debug",
            Self::Verbose(_) => "trace",
            Self::Default => DEFAULT_LOG_FILTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// Explicit filters are used verbatim. Implicit ones get the runtime directive prepended.
    pub fn compose(settings: &LogSettings) -> Self {
        let source = FilterSource::select(settings);
        let user = source.directive();
        if source.is_explicit() {
            return Self {
                console: user.to_string(),
                file: user.to_string(),
            };
        }
        Self {
            console: format!("{CONSOLE_RUNTIME_DIRECTIVE},{user}"),
            file: format!("{FILE_RUNTIME_DIRECTIVE},{user}"),
        }
    }
}

#[derive(Debug)]
pub enum FileSink {
    Rolling {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    ConsoleOnly {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

/// Daily rolling file under `<data_dir>/logs`. Any failure leaves the
/// console as the only sink, with the reason kept for a startup warning.
pub fn open_file_sink(settings: &LogSettings) -> FileSink {
    let Some(data_dir) = settings.data_dir.as_deref() else {
        return FileSink::ConsoleOnly {
            attempted_log_dir: None,
            reason: "no data directory configured".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSink::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention = match settings.retention_files {
        0 => DEFAULT_LOG_RETENTION_FILES,
        files => files,
    };
    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSink::Rolling { log_dir, appender },
        Err(error) => FileSink::ConsoleOnly {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to open rolling log file: {error}"),
        },
    }
}

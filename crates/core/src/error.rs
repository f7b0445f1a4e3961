//! Error kinds raised across the frame-inference bridge.

use std::path::PathBuf;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The native inference library is not loaded or could not be reached.
    #[error("inference backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("model directory unavailable: {}", path.display())]
    ModelDirectoryUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Discovery produced nothing usable, or the configured model is absent.
    #[error("{}", describe_missing_model(directory, requested.as_deref()))]
    NoModelAvailable {
        directory: PathBuf,
        requested: Option<String>,
    },

    #[error("session initialization failed for {}: {reason}", model.display())]
    SessionInitFailed { model: PathBuf, reason: String },

    #[error("inference failed: {reason}")]
    InferenceFailed { reason: String },

    /// Capture and reintegrate disagree on the buffer size. Always a logic error.
    #[error("frame buffer dimension mismatch: expected {expected} bytes, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl BridgeError {
    pub fn backend_unavailable(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    pub fn session_init(model: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::SessionInitFailed {
            model: model.into(),
            reason: reason.into(),
        }
    }

    pub fn inference(reason: impl Into<String>) -> Self {
        Self::InferenceFailed {
            reason: reason.into(),
        }
    }

    /// True for errors that signal a broken invariant inside the bridge rather
    /// than a condition of the environment.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::DimensionMismatch { .. })
    }

    /// Short stable name, used as the `kind` field in logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::ModelDirectoryUnavailable { .. } => "model_directory_unavailable",
            Self::NoModelAvailable { .. } => "no_model_available",
            Self::SessionInitFailed { .. } => "session_init_failed",
            Self::InferenceFailed { .. } => "inference_failed",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
        }
    }
}

fn describe_missing_model(directory: &std::path::Path, requested: Option<&str>) -> String {
    match requested {
        Some(name) => format!(
            "model '{name}' not found in {}",
            directory.display()
        ),
        None => format!("no usable model in {}", directory.display()),
    }
}

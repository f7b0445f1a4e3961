use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::types::ModelDescriptor;

/// Extension of the description file that identifies a model on disk.
pub const DEFAULT_DESCRIPTION_EXTENSION: &str = "onnx";

/// Weights file suffixes probed next to a description file, in order.
const WEIGHTS_SUFFIXES: [&str; 2] = ["bin", "onnx.data"];

/// Scan `directory` (non-recursively) for model description files.
///
/// Entries come back in filesystem enumeration order. A directory with no
/// matching files yields an empty list; a directory that cannot be read is
/// `ModelDirectoryUnavailable`.
pub fn discover_models(directory: &Path, extension: &str) -> BridgeResult<Vec<ModelDescriptor>> {
    let read_dir =
        fs::read_dir(directory).map_err(|source| BridgeError::ModelDirectoryUnavailable {
            path: directory.to_path_buf(),
            source,
        })?;

    let mut models = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| BridgeError::ModelDirectoryUnavailable {
            path: directory.to_path_buf(),
            source,
        })?;
        let path = entry.path();

        let matches = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if !matches || !path.is_file() {
            continue;
        }

        if let Err(error) = fs::File::open(&path) {
            warn!(path = %path.display(), error = %error, "Skipping unreadable model file");
            continue;
        }

        let Some(display_name) = path.file_stem().and_then(|s| s.to_str()) else {
            warn!(path = %path.display(), "Skipping model with non UTF-8 name");
            continue;
        };

        let weights_path = find_weights(&path);
        info!(
            name = %display_name,
            weights = weights_path.is_some(),
            "Discovered model"
        );

        models.push(ModelDescriptor {
            display_name: display_name.to_string(),
            description_path: path.clone(),
            weights_path,
        });
    }

    Ok(models)
}

fn find_weights(description: &Path) -> Option<PathBuf> {
    let file_name = description.file_name()?.to_str()?;
    let stem = description.file_stem()?.to_str()?;
    let dir = description.parent()?;

    WEIGHTS_SUFFIXES
        .iter()
        .flat_map(|suffix| {
            [
                dir.join(format!("{stem}.{suffix}")),
                dir.join(format!("{file_name}.{suffix}")),
            ]
        })
        .find(|candidate| candidate != description && candidate.is_file())
}

/// Discovered models of one directory, with lookup by display name.
pub struct ModelCatalog {
    models_dir: PathBuf,
    entries: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    pub fn discover(models_dir: PathBuf, extension: &str) -> BridgeResult<Self> {
        let entries = discover_models(&models_dir, extension)?;
        Ok(Self {
            models_dir,
            entries,
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn list(&self) -> &[ModelDescriptor] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first(&self) -> Option<&ModelDescriptor> {
        self.entries.first()
    }

    pub fn find(&self, name: &str) -> Option<&ModelDescriptor> {
        self.entries.iter().find(|e| e.display_name == name)
    }

    /// Pick the configured model, or the first one discovered.
    pub fn select(&self, requested: Option<&str>) -> BridgeResult<&ModelDescriptor> {
        let selected = match requested {
            Some(name) => self.find(name),
            None => self.first(),
        };
        selected.ok_or_else(|| BridgeError::NoModelAvailable {
            directory: self.models_dir.clone(),
            requested: requested.map(str::to_string),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model catalog")
    }
}

//! Locating the dynamically loaded inference runtime.
//!
//! `ort` is built with `load-dynamic`, so the ONNX Runtime shared library is
//! resolved at first use from `ORT_DYLIB_PATH`. A missing library would abort
//! inside `ort`; the bridge resolves it up front and reports
//! `BackendUnavailable` instead.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Search directories relative to the current executable for the runtime library.
///
/// Probes these locations in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` (Unix only)
///   6. `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Where the runtime library came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeLibrary {
    /// `ORT_DYLIB_PATH` was already set by the user.
    FromEnv(PathBuf),
    /// Found by probing the candidate directories.
    Discovered(PathBuf),
    Missing,
}

impl RuntimeLibrary {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::FromEnv(path) | Self::Discovered(path) => Some(path),
            Self::Missing => None,
        }
    }
}

fn resolve_in(env_value: Option<PathBuf>, dirs: &[PathBuf]) -> RuntimeLibrary {
    if let Some(path) = env_value {
        return RuntimeLibrary::FromEnv(path);
    }
    match find_ort_dylib_in_dirs(dirs) {
        Some(path) => RuntimeLibrary::Discovered(path),
        None => RuntimeLibrary::Missing,
    }
}

/// Resolve the runtime library without touching the environment.
pub fn resolve_runtime_library() -> RuntimeLibrary {
    resolve_in(
        env::var_os(ORT_DYLIB_ENV).map(PathBuf::from),
        &candidate_lib_dirs(),
    )
}

/// Resolve the runtime library and export `ORT_DYLIB_PATH` for `ort`.
///
/// Call this at the very start of `main()`, before any other thread exists.
pub fn setup_runtime_libs() -> RuntimeLibrary {
    let resolved = resolve_runtime_library();
    if let RuntimeLibrary::Discovered(path) = &resolved {
        env::set_var(ORT_DYLIB_ENV, path);
    }
    resolved
}

/// Log which runtime library was resolved, for diagnostics.
/// Call after tracing is initialized.
pub fn log_runtime_lib_status(library: &RuntimeLibrary) {
    match library {
        RuntimeLibrary::FromEnv(path) | RuntimeLibrary::Discovered(path) => {
            if path.is_file() {
                info!(path = %path.display(), "ONNX Runtime library resolved");
            } else {
                warn!(
                    path = %path.display(),
                    "{ORT_DYLIB_ENV} points to a missing file; inference will be unavailable"
                );
            }
        }
        RuntimeLibrary::Missing => {
            warn!("ONNX Runtime library not found; inference will be unavailable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn env_value_wins_over_probing() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        std::fs::write(temp.path().join(ORT_LIB_NAME), b"lib").expect("lib should be written");

        let explicit = PathBuf::from("/opt/ort/custom.so");
        let resolved = resolve_in(Some(explicit.clone()), &[temp.path().to_path_buf()]);
        assert_eq!(resolved, RuntimeLibrary::FromEnv(explicit));
    }

    #[test]
    fn probing_prefers_first_directory() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).expect("first dir should be created");
        std::fs::create_dir_all(&second).expect("second dir should be created");
        std::fs::write(first.join(ORT_LIB_NAME), b"first").expect("first lib");
        std::fs::write(second.join(ORT_LIB_NAME), b"second").expect("second lib");

        let resolved = resolve_in(None, &[first.clone(), second]);
        assert_eq!(resolved, RuntimeLibrary::Discovered(first.join(ORT_LIB_NAME)));
    }

    #[test]
    fn missing_library_has_no_path() {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let resolved = resolve_in(None, &[temp.path().to_path_buf()]);
        assert_eq!(resolved, RuntimeLibrary::Missing);
        assert!(resolved.path().is_none());
    }
}

//! Process-wide native-runtime bootstrap.
//!
//! Loading a native execution library must happen at most once per process.
//! Rather than hiding that in ambient global state, detection runs behind an
//! explicit once-guard with a recorded success/failure outcome: the first
//! [`bootstrap`] call decides, every later call observes the same result.

use crate::error::{Error, Result};
use crate::runner::RunnerConfig;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// Outcome of native-runtime detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    pub library_path: String,
    pub version: String,
    pub initialized: bool,
}

static BOOTSTRAP: OnceLock<std::result::Result<RuntimeInfo, String>> = OnceLock::new();
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Well-known native library locations probed when nothing is configured.
const LIBRARY_CANDIDATES: &[&str] = &[
    "/usr/lib/libonnxruntime.so",
    "/usr/local/lib/libonnxruntime.so",
    "/opt/homebrew/lib/libonnxruntime.dylib",
    "C:/onnxruntime/lib/onnxruntime.dll",
];

/// Detect and record the native runtime exactly once per process.
///
/// On first success the resolved library path is exported as
/// `ORT_DYLIB_PATH` so dynamically loading backends pick it up before any
/// session is created. The recorded outcome (success or failure) is returned
/// unchanged on every subsequent call, regardless of the config passed in.
pub fn bootstrap(cfg: &RunnerConfig) -> Result<RuntimeInfo> {
    if SHUTDOWN.load(Ordering::SeqCst) {
        return Err(Error::Bootstrap(
            "runtime has been shut down".to_string(),
        ));
    }
    let outcome = BOOTSTRAP.get_or_init(|| {
        detect_runtime(cfg)
            .map(|mut info| {
                std::env::set_var("ORT_DYLIB_PATH", &info.library_path);
                info.initialized = true;
                info
            })
            .map_err(|e| e.to_string())
    });
    match outcome {
        Ok(info) => Ok(info.clone()),
        Err(msg) => Err(Error::Bootstrap(msg.clone())),
    }
}

/// Mark the runtime as shut down. Idempotent; later [`bootstrap`] calls fail
/// with a bootstrap error.
pub fn shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Resolve the native library path and version without touching the
/// process-wide once-guard.
///
/// Resolution order: explicit config, `GLOR_ORT_LIB`, `ORT_LIBRARY_PATH`,
/// then a fixed list of well-known install locations.
pub fn detect_runtime(cfg: &RunnerConfig) -> Result<RuntimeInfo> {
    let mut path = cfg.library_path.clone();
    if path.is_empty() {
        path = std::env::var("GLOR_ORT_LIB").unwrap_or_default();
    }
    if path.is_empty() {
        path = std::env::var("ORT_LIBRARY_PATH").unwrap_or_default();
    }
    if path.is_empty() {
        for candidate in LIBRARY_CANDIDATES {
            if Path::new(candidate).exists() {
                path = (*candidate).to_string();
                break;
            }
        }
    }

    if path.is_empty() {
        return Err(Error::Bootstrap(
            "unable to detect native runtime library path".to_string(),
        ));
    }
    if !Path::new(&path).exists() {
        return Err(Error::Bootstrap(format!(
            "runtime library path check failed: {path}"
        )));
    }

    let version = infer_version_from_path(&path).unwrap_or_else(|| "unknown".to_string());
    Ok(RuntimeInfo {
        library_path: path,
        version,
        initialized: false,
    })
}

/// Pull a `major.minor.patch` version out of a library file name, if any.
fn infer_version_from_path(path: &str) -> Option<String> {
    let name = Path::new(path).file_name()?.to_str()?;
    for candidate in name.split(|c: char| !c.is_ascii_digit() && c != '.') {
        if let Some(version) = parse_semverish(candidate) {
            return Some(version);
        }
    }
    None
}

fn parse_semverish(candidate: &str) -> Option<String> {
    let trimmed = candidate.trim_matches('.');
    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
    {
        Some(trimmed.to_string())
    } else {
        None
    }
}

//! Error taxonomy for the orchestration core.
//!
//! Every failure surfaced by this crate falls into one of a few classes:
//! configuration and shape errors, a required graph missing from the registry,
//! a graph execution failing, or the caller cancelling a generation. The
//! variants are deliberately matchable so callers can tell an incomplete model
//! bundle apart from a transient execution failure.

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors produced by the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A tensor shape does not match its data or is otherwise invalid.
    #[error("shape error: {0}")]
    Shape(String),

    /// A dtype string could not be canonicalized to a supported dtype.
    #[error("unsupported tensor dtype {0:?}")]
    UnsupportedDtype(String),

    /// Extracting typed data from a tensor or runner output failed.
    #[error("extract error: {0}")]
    Extract(String),

    /// The manifest is malformed or references unusable graph files.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// A manifest or graph file could not be read.
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A required named graph is absent from the registry. This is the
    /// dominant signal for an incomplete model bundle.
    #[error("{graph} graph not found in manifest")]
    GraphNotFound { graph: String },

    /// A graph executed but a required named output was missing.
    #[error("{graph}: missing {output:?} in output")]
    MissingOutput { graph: String, output: String },

    /// The underlying graph invocation failed.
    #[error("{stage}: {message}")]
    Execution { stage: String, message: String },

    /// The engine was built without a native execution backend.
    #[error("graph {graph:?}: execution backend disabled (build with the backend-ort feature)")]
    BackendDisabled { graph: String },

    /// The native runtime library could not be located or initialized.
    #[error("runtime bootstrap: {0}")]
    Bootstrap(String),

    /// The caller cancelled the generation in progress.
    #[error("generation cancelled")]
    Cancelled,

    /// Invalid argument to a top-level operation (e.g. empty token slice).
    #[error("{0}")]
    InvalidInput(String),
}

impl Error {
    /// Wrap an execution failure with the stage that observed it.
    pub(crate) fn execution(stage: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Execution {
            stage: stage.into(),
            message: err.to_string(),
        }
    }
}

//! Graph manifest loading.
//!
//! A model bundle ships a JSON manifest describing each computation graph:
//! its name, its file location relative to the manifest, and the declared
//! input/output node signatures. The manifest is parsed once at engine
//! construction and the resulting [`GraphSession`] descriptors are immutable
//! afterward.

use crate::error::{Error, Result};
use crate::tensor::DimSpec;
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use tracing::info;

/// A declared input or output node of a graph.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub dtype: String,
    #[serde(default)]
    pub shape: Vec<DimSpec>,
}

/// One loaded graph descriptor: name, resolved absolute file path, and the
/// declared node signatures.
#[derive(Debug, Clone)]
pub struct GraphSession {
    pub name: String,
    pub path: PathBuf,
    pub inputs: Vec<NodeInfo>,
    pub outputs: Vec<NodeInfo>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    graphs: Vec<ManifestGraph>,
}

#[derive(Debug, Deserialize)]
struct ManifestGraph {
    name: String,
    filename: String,
    #[serde(default)]
    inputs: Vec<NodeInfo>,
    #[serde(default)]
    outputs: Vec<NodeInfo>,
}

/// Parsed manifest: an ordered set of graph sessions keyed by name.
#[derive(Debug)]
pub struct Manifest {
    sessions: Vec<GraphSession>,
}

impl Manifest {
    /// Load and validate a manifest from disk.
    ///
    /// Graph files are resolved relative to the manifest's directory and must
    /// exist. Duplicate names, empty names, and empty filenames are rejected.
    pub fn load(manifest_path: impl AsRef<Path>) -> Result<Self> {
        let manifest_path = manifest_path.as_ref();
        if manifest_path.as_os_str().is_empty() {
            return Err(Error::Manifest("manifest path is required".to_string()));
        }

        let raw = std::fs::read_to_string(manifest_path).map_err(|source| Error::Io {
            path: manifest_path.to_path_buf(),
            source,
        })?;
        let parsed: ManifestFile = serde_json::from_str(&raw)
            .map_err(|e| Error::Manifest(format!("decode manifest: {e}")))?;

        if parsed.graphs.is_empty() {
            return Err(Error::Manifest("manifest has no graphs".to_string()));
        }

        let base_dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        let mut sessions: Vec<GraphSession> = Vec::with_capacity(parsed.graphs.len());

        for graph in parsed.graphs {
            if graph.name.is_empty() {
                return Err(Error::Manifest("manifest graph has empty name".to_string()));
            }
            if graph.filename.is_empty() {
                return Err(Error::Manifest(format!(
                    "manifest graph {:?} has empty filename",
                    graph.name
                )));
            }
            if sessions.iter().any(|s| s.name == graph.name) {
                return Err(Error::Manifest(format!(
                    "duplicate graph name {:?} in manifest",
                    graph.name
                )));
            }

            let mut session_path = PathBuf::from(&graph.filename);
            if session_path.is_relative() {
                session_path = base_dir.join(session_path);
            }
            let session_path = clean_path(&session_path);
            if !session_path.exists() {
                return Err(Error::Manifest(format!(
                    "graph file for {:?} not found: {}",
                    graph.name,
                    session_path.display()
                )));
            }

            info!(
                graph = %graph.name,
                path = %session_path.display(),
                inputs = %node_names(&graph.inputs),
                outputs = %node_names(&graph.outputs),
                "loaded graph session"
            );

            sessions.push(GraphSession {
                name: graph.name,
                path: session_path,
                inputs: graph.inputs,
                outputs: graph.outputs,
            });
        }

        Ok(Self { sessions })
    }

    /// All sessions in manifest order.
    pub fn sessions(&self) -> &[GraphSession] {
        &self.sessions
    }

    /// Look up a session by graph name.
    pub fn session(&self, name: &str) -> Option<&GraphSession> {
        self.sessions.iter().find(|s| s.name == name)
    }
}

/// Lexically normalize a path, folding `.` and `..` components.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn node_names(nodes: &[NodeInfo]) -> String {
    nodes
        .iter()
        .map(|n| n.name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

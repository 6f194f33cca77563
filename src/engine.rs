//! Engine: the name-to-runner registry driving every graph invocation.
//!
//! The engine owns one [`GraphRunner`] per manifest graph and is the only
//! shared state between concurrent generations. Each invocation is stateless
//! from the registry's point of view; all per-generation state (KV-cache,
//! growing latent sequence) lives in caller-owned objects.

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::runner::{GraphRunner, RunnerConfig};
use crate::tensor::Tensor;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[cfg(feature = "backend-ort")]
use crate::runner::OrtRunner;
#[cfg(not(feature = "backend-ort"))]
use crate::runner::DisabledRunner;

/// Graph registry loaded from a manifest or supplied directly.
pub struct Engine {
    runners: HashMap<String, Arc<dyn GraphRunner>>,
    closed: AtomicBool,
}

impl Engine {
    /// Load the manifest and create one runner per graph.
    ///
    /// If any runner fails to construct, every runner already built in this
    /// batch is closed before the error propagates, so a failed construction
    /// never leaks a partial engine.
    pub fn from_manifest(manifest_path: impl AsRef<Path>, cfg: &RunnerConfig) -> Result<Self> {
        let manifest = Manifest::load(manifest_path)?;
        let runners = build_registry(manifest.sessions(), |session| build_runner(session, cfg))?;
        Ok(Self {
            runners,
            closed: AtomicBool::new(false),
        })
    }

    /// Build an engine from externally supplied runners.
    ///
    /// Used by tests and alternate execution environments. Taking the map by
    /// value transfers ownership, so later caller-side changes cannot reach
    /// the engine.
    pub fn with_runners(runners: HashMap<String, Arc<dyn GraphRunner>>) -> Self {
        Self {
            runners,
            closed: AtomicBool::new(false),
        }
    }

    /// Look up the named runner, if registered.
    pub fn runner(&self, name: &str) -> Option<&Arc<dyn GraphRunner>> {
        self.runners.get(name)
    }

    /// Whether the named graph is available. Used by the generation loop to
    /// pick the stateful path when a prefill graph is present.
    pub fn has_graph(&self, name: &str) -> bool {
        self.runners.contains_key(name)
    }

    /// Run the named graph, failing with a distinct not-found error when the
    /// name is absent from the registry.
    pub fn run_graph(
        &self,
        name: &str,
        inputs: &HashMap<String, Tensor>,
    ) -> Result<HashMap<String, Tensor>> {
        let runner = self.runners.get(name).ok_or_else(|| Error::GraphNotFound {
            graph: name.to_string(),
        })?;
        runner.run(inputs)
    }

    /// Close every runner. Idempotent; also invoked on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for runner in self.runners.values() {
            runner.close();
        }
    }

    /// Run the `text_conditioner` graph on a token-id sequence and return
    /// text embeddings shaped `[1, T, E]`.
    pub fn text_conditioner(&self, tokens: &[i64]) -> Result<Tensor> {
        if tokens.is_empty() {
            return Err(Error::InvalidInput(
                "text_conditioner: token slice must not be empty".to_string(),
            ));
        }

        let token_tensor = Tensor::from_i64(tokens.to_vec(), &[1, tokens.len() as i64])?;
        let inputs = HashMap::from([("tokens".to_string(), token_tensor)]);
        let outputs = self.run_graph("text_conditioner", &inputs)?;

        outputs
            .get("text_embeddings")
            .cloned()
            .ok_or_else(|| Error::MissingOutput {
                graph: "text_conditioner".to_string(),
                output: "text_embeddings".to_string(),
            })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build one runner per session. If any construction fails, every runner
/// already built in this batch is closed before the error propagates, so a
/// failed construction never leaks a partial registry.
fn build_registry<F>(
    sessions: &[crate::manifest::GraphSession],
    mut build: F,
) -> Result<HashMap<String, Arc<dyn GraphRunner>>>
where
    F: FnMut(&crate::manifest::GraphSession) -> Result<Arc<dyn GraphRunner>>,
{
    let mut runners: HashMap<String, Arc<dyn GraphRunner>> =
        HashMap::with_capacity(sessions.len());
    for session in sessions {
        let runner = match build(session) {
            Ok(runner) => runner,
            Err(err) => {
                for r in runners.values() {
                    r.close();
                }
                return Err(err);
            }
        };
        info!(graph = %session.name, "registered graph runner");
        runners.insert(session.name.clone(), runner);
    }
    Ok(runners)
}

fn build_runner(
    session: &crate::manifest::GraphSession,
    cfg: &RunnerConfig,
) -> Result<Arc<dyn GraphRunner>> {
    #[cfg(feature = "backend-ort")]
    {
        crate::runtime::bootstrap(cfg)?;
        Ok(Arc::new(OrtRunner::new(session, cfg)?))
    }
    #[cfg(not(feature = "backend-ort"))]
    {
        let _ = cfg;
        Ok(Arc::new(DisabledRunner::new(session)))
    }
}

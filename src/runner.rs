//! The graph-execution contract and its backends.
//!
//! [`GraphRunner`] is the capability seam between the orchestration core and
//! whatever actually executes a graph: given named input tensors, produce
//! named output tensors, expose a stable name, release resources on close.
//! The core depends only on this trait, so backends are interchangeable:
//! a native ONNX Runtime executor (feature `backend-ort`), a closure-backed
//! runner for tests and alternate execution environments, and a disabled
//! stub used when no native backend is compiled in.

use crate::error::{Error, Result};
use crate::manifest::GraphSession;
use crate::tensor::Tensor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Capability contract for executing one named graph.
///
/// Implementations must tolerate concurrent `run` calls: the engine registry
/// is shared read-only across parallel generations. `close` must be
/// idempotent and safe to call on a partially constructed instance.
pub trait GraphRunner: Send + Sync {
    /// Execute the graph with the given named input tensors.
    fn run(&self, inputs: &HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>>;

    /// The graph name from the manifest.
    fn name(&self) -> &str;

    /// Release held resources. Idempotent.
    fn close(&self);
}

/// Native runtime settings consumed when constructing runners.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Explicit path to the native ONNX Runtime library. When empty, the
    /// bootstrap falls back to environment variables and well-known paths.
    pub library_path: String,
    /// Intra-op thread count for native sessions. Zero lets the runtime pick.
    pub intra_threads: usize,
}

/// Stub runner used when the crate is built without a native backend.
///
/// It satisfies the full contract so manifests still load and close cleanly,
/// but every `run` fails with a backend-disabled error naming the graph.
#[derive(Debug)]
pub struct DisabledRunner {
    name: String,
}

impl DisabledRunner {
    pub fn new(session: &GraphSession) -> Self {
        Self {
            name: session.name.clone(),
        }
    }
}

impl GraphRunner for DisabledRunner {
    fn run(&self, _inputs: &HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        Err(Error::BackendDisabled {
            graph: self.name.clone(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {}
}

/// Closure-backed runner.
///
/// This is the seam for alternate execution environments (an interpreted
/// fallback, a js/wasm bridge) and for the test suite, which drives the whole
/// generation pipeline through fake graphs.
pub struct FnRunner<F>
where
    F: Fn(&HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> + Send + Sync,
{
    name: String,
    f: F,
    closed: AtomicBool,
}

impl<F> FnRunner<F>
where
    F: Fn(&HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            closed: AtomicBool::new(false),
        }
    }

    /// Whether `close` has been called at least once.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<F> GraphRunner for FnRunner<F>
where
    F: Fn(&HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> + Send + Sync,
{
    fn run(&self, inputs: &HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::execution(self.name.clone(), "runner is closed"));
        }
        (self.f)(inputs)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(feature = "backend-ort")]
pub use ort_backend::OrtRunner;

#[cfg(feature = "backend-ort")]
mod ort_backend {
    use super::*;
    use crate::tensor::DType;
    use ort::session::Session;
    use ort::value::{DynValue, Tensor as OrtTensor};
    use std::sync::Mutex;
    use tracing::info;

    /// ONNX Runtime-backed executor for a single graph.
    ///
    /// The session is guarded by a mutex: ORT session invocation is not
    /// re-entrant, and the engine registry is shared across generations.
    pub struct OrtRunner {
        name: String,
        session: Mutex<Option<Session>>,
    }

    impl OrtRunner {
        pub fn new(session: &GraphSession, cfg: &RunnerConfig) -> Result<Self> {
            let mut builder = Session::builder()
                .map_err(|e| Error::execution(format!("ort session for {:?}", session.name), e))?;
            if cfg.intra_threads > 0 {
                builder = builder.with_intra_threads(cfg.intra_threads).map_err(|e| {
                    Error::execution(format!("ort session for {:?}", session.name), e)
                })?;
            }
            let ort_session = builder.commit_from_file(&session.path).map_err(|e| {
                Error::execution(
                    format!("ort session for {:?} ({})", session.name, session.path.display()),
                    e,
                )
            })?;
            info!(graph = %session.name, "created ONNX runner");
            Ok(Self {
                name: session.name.clone(),
                session: Mutex::new(Some(ort_session)),
            })
        }
    }

    impl GraphRunner for OrtRunner {
        fn run(&self, inputs: &HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
            let mut guard = self
                .session
                .lock()
                .map_err(|_| Error::execution(self.name.clone(), "session lock poisoned"))?;
            let session = guard
                .as_mut()
                .ok_or_else(|| Error::execution(self.name.clone(), "runner is closed"))?;

            let mut ort_inputs: Vec<(String, DynValue)> = Vec::with_capacity(inputs.len());
            for (name, tensor) in inputs {
                ort_inputs.push((name.clone(), to_ort_value(name, tensor)?));
            }

            let outputs = session
                .run(ort_inputs)
                .map_err(|e| Error::execution(format!("run {:?}", self.name), e))?;

            let mut results = HashMap::with_capacity(outputs.len());
            for (name, value) in outputs.iter() {
                results.insert(name.to_string(), from_ort_value(name, &value)?);
            }
            Ok(results)
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn close(&self) {
            if let Ok(mut guard) = self.session.lock() {
                guard.take();
            }
        }
    }

    fn to_ort_value(name: &str, tensor: &Tensor) -> Result<DynValue> {
        let shape = tensor.shape();
        match tensor.dtype() {
            DType::F32 => OrtTensor::from_array((shape, tensor.f32_data()?))
                .map(OrtTensor::into_dyn)
                .map_err(|e| Error::execution(format!("input {name:?}"), e)),
            DType::I64 => OrtTensor::from_array((shape, tensor.i64_data()?))
                .map(OrtTensor::into_dyn)
                .map_err(|e| Error::execution(format!("input {name:?}"), e)),
        }
    }

    fn from_ort_value(name: &str, value: &DynValue) -> Result<Tensor> {
        if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
            let dims: Vec<i64> = shape.iter().copied().collect();
            return Tensor::from_f32(data.to_vec(), &dims);
        }
        if let Ok((shape, data)) = value.try_extract_tensor::<i64>() {
            let dims: Vec<i64> = shape.iter().copied().collect();
            return Tensor::from_i64(data.to_vec(), &dims);
        }
        Err(Error::Extract(format!(
            "output {name:?} has unsupported element type"
        )))
    }
}

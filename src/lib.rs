//! # glor - Graph-Orchestrated Flow-Matching Text-to-Speech
//!
//! This crate drives autoregressive, flow-matching speech synthesis over a
//! set of opaque, externally supplied computation graphs. It turns a token-id
//! sequence into 24 kHz PCM by orchestrating a fixed pipeline:
//!
//! 1. **Text conditioning**: the `text_conditioner` graph embeds token ids
//!    into the flow-LM's conditioning space (optionally with a spliced voice
//!    embedding for voice cloning).
//! 2. **Autoregressive flow-LM loop**: each step produces a hidden state and
//!    an EOS logit, then an Euler flow-matching decode refines noise into one
//!    latent frame. When the bundle ships a `flow_lm_prefill` graph the loop
//!    maintains an explicit KV-cache; otherwise it replays the growing
//!    sequence each step.
//! 3. **Audio decode**: stacked latent frames pass through `latent_to_mimi`
//!    and `mimi_decoder` to produce PCM.
//!
//! The crate never looks inside a graph. Graphs are named units of
//! computation with documented input/output tensor contracts, loaded from a
//! JSON manifest and executed through the [`GraphRunner`] capability trait,
//! so execution backends are interchangeable (native ONNX Runtime behind the
//! `backend-ort` feature, closure-backed runners for tests and alternate
//! environments).
//!
//! ## Quick start
//!
//! ```no_run
//! use glor::{CancelToken, Engine, GenerateConfig, RunnerConfig};
//!
//! let engine = Engine::from_manifest("models/manifest.json", &RunnerConfig::default())?;
//! let tokens: Vec<i64> = vec![17, 42, 365]; // from an external tokenizer
//! let pcm = engine.generate_audio(&CancelToken::new(), &tokens, &GenerateConfig::default())?;
//! println!("{} samples at {} Hz", pcm.len(), glor::SAMPLE_RATE);
//! # Ok::<(), glor::Error>(())
//! ```
//!
//! ## Error semantics
//!
//! Missing graphs surface as [`Error::GraphNotFound`] naming the graph, the
//! usual sign of an incomplete model bundle. Execution failures abort the
//! whole generation; no partial audio is returned. Non-finite values are not
//! detected or rejected here: they propagate, and EOS detection is fail-safe
//! against NaN (a corrupted logit never stops generation early). Callers
//! that need corruption detection should inspect the final PCM for
//! finiteness.

pub mod audio_decode;
pub mod engine;
pub mod error;
pub mod flow_lm;
pub mod generate;
pub mod manifest;
pub mod runner;
pub mod runtime;
pub mod tensor;

pub use audio_decode::{stack_latent_frames, SAMPLE_RATE};
pub use engine::Engine;
pub use error::{Error, Result};
pub use flow_lm::{
    append_latent_frame, eos_detected, new_bos_sequence, FlowLmKvState, LATENT_DIM,
};
pub use generate::{CancelToken, GenerateConfig, StepCallback};
pub use manifest::{GraphSession, Manifest, NodeInfo};
pub use runner::{DisabledRunner, FnRunner, GraphRunner, RunnerConfig};
pub use runtime::{bootstrap, detect_runtime, shutdown, RuntimeInfo};
pub use tensor::{concat_axis1, extract_f32, extract_i64, DType, DimSpec, Tensor, Value};

#[cfg(feature = "backend-ort")]
pub use runner::OrtRunner;

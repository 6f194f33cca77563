//! Flow-LM step primitives: BOS handling, autoregressive steps, the KV-cache,
//! EOS detection, and the Euler flow-matching decoder.
//!
//! Two step styles drive the autoregressive loop. The stateless style replays
//! the full growing latent sequence through `flow_lm_main` every iteration.
//! The stateful style runs `flow_lm_prefill` once to build an explicit
//! KV-cache, then advances it with `flow_lm_step` using only the newest frame.
//! Both produce the same `(last_hidden, eos_logits)` contract.

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::tensor::Tensor;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;

/// Latent width of each flow-LM frame.
pub const LATENT_DIM: usize = 32;

/// Create the initial BOS (beginning-of-sequence) tensor: `[1, 1, 32]` filled
/// with NaN. The flow-LM graphs contractually replace NaN input with a
/// learned BOS embedding; the orchestration layer assumes, and cannot verify,
/// that contract.
pub fn new_bos_sequence() -> Tensor {
    let data = vec![f32::NAN; LATENT_DIM];
    Tensor::from_f32(data, &[1, 1, LATENT_DIM as i64])
        .expect("BOS shape is statically valid")
}

/// Concatenate a latent frame `[1, 1, 32]` onto a sequence `[1, S, 32]`,
/// producing a new `[1, S+1, 32]` tensor.
pub fn append_latent_frame(sequence: &Tensor, frame: &Tensor) -> Result<Tensor> {
    let seq_shape = sequence.shape();
    let frame_shape = frame.shape();
    let d = LATENT_DIM as i64;

    if seq_shape.len() != 3 || seq_shape[0] != 1 || seq_shape[2] != d {
        return Err(Error::Shape(format!(
            "sequence shape {seq_shape:?} invalid, want [1, S, {d}]"
        )));
    }
    if frame_shape.len() != 3 || frame_shape[0] != 1 || frame_shape[1] != 1 || frame_shape[2] != d {
        return Err(Error::Shape(format!(
            "frame shape {frame_shape:?} invalid, want [1, 1, {d}]"
        )));
    }

    let mut combined = sequence.f32_data()?;
    combined.extend(frame.f32_data()?);
    Tensor::from_f32(combined, &[1, seq_shape[1] + 1, d])
}

/// True when the raw EOS logit strictly exceeds the threshold.
///
/// Fail-safe by construction: extraction failures and empty tensors yield
/// `false`, and a NaN logit can never satisfy `>`, so corrupted model output
/// never forces a spurious stop.
pub fn eos_detected(eos_logits: &Tensor, threshold: f64) -> bool {
    match eos_logits.f32_data() {
        Ok(data) if !data.is_empty() => f64::from(data[0]) > threshold,
        _ => false,
    }
}

/// KV-cache accumulated during prefill and advanced by each stateful step.
///
/// `kv[i]` is logically `[2, 1, cached_len, heads, head_dim]` with dimension
/// 0 distinguishing key from value; `offset` is the number of positions
/// already cached. The state has exactly one owner per generation and is
/// mutated in place by [`Engine::flow_lm_step_stateful`].
#[derive(Debug)]
pub struct FlowLmKvState {
    pub kv: Vec<Tensor>,
    pub offset: i64,
}

impl Engine {
    /// Run a single stateless autoregressive step of `flow_lm_main`.
    ///
    /// Inputs: the growing latent sequence `[1, S, 32]` and the text
    /// embeddings `[1, T, E]`. Outputs: `last_hidden` `[1, H]` and the raw
    /// `eos_logits` `[1, 1]`.
    pub fn flow_lm_step(
        &self,
        sequence: &Tensor,
        text_embeddings: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let inputs = HashMap::from([
            ("sequence".to_string(), sequence.clone()),
            ("text_embeddings".to_string(), text_embeddings.clone()),
        ]);
        let outputs = self.run_graph("flow_lm_main", &inputs)?;

        let last_hidden = required_output(&outputs, "flow_lm_main", "last_hidden")?;
        let eos_logits = required_output(&outputs, "flow_lm_main", "eos_logits")?;
        Ok((last_hidden, eos_logits))
    }

    /// Run `flow_lm_prefill` on the conditioning embeddings and unpack the
    /// resulting KV-cache.
    ///
    /// Per-layer tensors are discovered open-endedly: `kv_0, kv_1, ...` until
    /// the first missing index. The layer count is declared nowhere else.
    pub fn flow_lm_prefill(&self, text_embeddings: &Tensor) -> Result<FlowLmKvState> {
        let inputs = HashMap::from([("text_embeddings".to_string(), text_embeddings.clone())]);
        let outputs = self.run_graph("flow_lm_prefill", &inputs)?;

        let kv = collect_kv_outputs(&outputs);
        if kv.is_empty() {
            return Err(Error::MissingOutput {
                graph: "flow_lm_prefill".to_string(),
                output: "kv_0".to_string(),
            });
        }

        let offset = unpack_offset(&outputs, "flow_lm_prefill")?;
        Ok(FlowLmKvState { kv, offset })
    }

    /// Run one stateful autoregressive step of `flow_lm_step`.
    ///
    /// The current frame `[1, 1, 32]` and the cache contents are fed to the
    /// graph; on success every per-layer tensor in `state` is replaced with
    /// the graph's longer output and `state.offset` advances. The state is
    /// only touched on success.
    pub fn flow_lm_step_stateful(
        &self,
        frame: &Tensor,
        state: &mut FlowLmKvState,
    ) -> Result<(Tensor, Tensor)> {
        let mut inputs = HashMap::with_capacity(state.kv.len() + 2);
        inputs.insert("frame".to_string(), frame.clone());
        for (i, kv) in state.kv.iter().enumerate() {
            inputs.insert(format!("kv_{i}"), kv.clone());
        }
        inputs.insert(
            "offset".to_string(),
            Tensor::from_i64(vec![state.offset], &[1])?,
        );

        let outputs = self.run_graph("flow_lm_step", &inputs)?;

        let kv = collect_kv_outputs(&outputs);
        if kv.is_empty() {
            return Err(Error::MissingOutput {
                graph: "flow_lm_step".to_string(),
                output: "kv_0".to_string(),
            });
        }
        let offset = unpack_offset(&outputs, "flow_lm_step")?;
        let last_hidden = required_output(&outputs, "flow_lm_step", "last_hidden")?;
        let eos_logits = required_output(&outputs, "flow_lm_step", "eos_logits")?;

        state.kv = kv;
        state.offset = offset;
        Ok((last_hidden, eos_logits))
    }

    /// Euler flow-matching decode: integrate the learned velocity field to
    /// turn `last_hidden` `[1, H]` into one latent frame `[1, 1, 32]`.
    ///
    /// Noise `x` starts all-zero when `temperature == 0`, otherwise iid
    /// normal scaled by `sqrt(temperature)`. Each of the `steps` sub-steps
    /// runs `flow_lm_flow` at `s = i/steps`, `t = (i+1)/steps` and applies
    /// `x += flow_direction / steps`. `steps = 1` degenerates to a single
    /// Euler update from t=0 to t=1.
    pub fn flow_lm_flow(
        &self,
        last_hidden: &Tensor,
        temperature: f64,
        steps: usize,
    ) -> Result<Tensor> {
        if !self.has_graph("flow_lm_flow") {
            return Err(Error::GraphNotFound {
                graph: "flow_lm_flow".to_string(),
            });
        }

        let mut x = vec![0.0_f32; LATENT_DIM];
        if temperature > 0.0 {
            let stddev = temperature.sqrt();
            let normal = Normal::new(0.0_f64, stddev)
                .map_err(|e| Error::execution("flow_lm_flow: noise", e))?;
            let mut rng = rand::thread_rng();
            for value in &mut x {
                *value = normal.sample(&mut rng) as f32;
            }
        }

        let f_steps = steps as f32;
        for i in 0..steps {
            let s = i as f32 / f_steps;
            let t = (i as f32 + 1.0) / f_steps;

            let inputs = HashMap::from([
                ("condition".to_string(), last_hidden.clone()),
                ("s".to_string(), Tensor::from_f32(vec![s], &[1, 1])?),
                ("t".to_string(), Tensor::from_f32(vec![t], &[1, 1])?),
                (
                    "x".to_string(),
                    Tensor::from_f32(x.clone(), &[1, LATENT_DIM as i64])?,
                ),
            ]);

            let outputs = self
                .run_graph("flow_lm_flow", &inputs)
                .map_err(|e| Error::execution(format!("flow_lm_flow step {i}"), e))?;
            let flow_dir =
                outputs
                    .get("flow_direction")
                    .ok_or_else(|| Error::MissingOutput {
                        graph: format!("flow_lm_flow step {i}"),
                        output: "flow_direction".to_string(),
                    })?;
            let dir_data = flow_dir
                .f32_data()
                .map_err(|e| Error::execution(format!("flow_lm_flow step {i}"), e))?;
            if dir_data.len() != x.len() {
                return Err(Error::Shape(format!(
                    "flow_lm_flow step {i}: flow_direction has {} elements, want {}",
                    dir_data.len(),
                    x.len()
                )));
            }

            for (value, dir) in x.iter_mut().zip(&dir_data) {
                *value += dir / f_steps;
            }
        }

        Tensor::from_f32(x, &[1, 1, LATENT_DIM as i64])
    }
}

fn required_output(
    outputs: &HashMap<String, Tensor>,
    graph: &str,
    name: &str,
) -> Result<Tensor> {
    outputs
        .get(name)
        .cloned()
        .ok_or_else(|| Error::MissingOutput {
            graph: graph.to_string(),
            output: name.to_string(),
        })
}

/// Collect `kv_0, kv_1, ...` from a graph's outputs, stopping at the first
/// missing index.
fn collect_kv_outputs(outputs: &HashMap<String, Tensor>) -> Vec<Tensor> {
    let mut kv = Vec::new();
    for i in 0.. {
        match outputs.get(&format!("kv_{i}")) {
            Some(tensor) => kv.push(tensor.clone()),
            None => break,
        }
    }
    kv
}

fn unpack_offset(outputs: &HashMap<String, Tensor>, graph: &str) -> Result<i64> {
    let offset_tensor = outputs.get("offset").ok_or_else(|| Error::MissingOutput {
        graph: graph.to_string(),
        output: "offset".to_string(),
    })?;
    let offset_data = offset_tensor
        .i64_data()
        .map_err(|e| Error::execution(format!("{graph}: extract offset"), e))?;
    offset_data.first().copied().ok_or_else(|| {
        Error::Extract(format!("{graph}: offset tensor is empty"))
    })
}

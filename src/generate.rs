//! The autoregressive generation loop: token ids in, 24 kHz PCM out.
//!
//! Pipeline: text conditioning, optional voice-embedding splice, the
//! autoregressive flow-LM loop (stateful with an explicit KV-cache when the
//! prefill graph is available, stateless replay otherwise), then latent
//! stacking and the two-stage audio decode. Any failure at any stage aborts
//! the whole generation; no partial audio is ever returned.

use crate::audio_decode::stack_latent_frames;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::flow_lm::{append_latent_frame, eos_detected, new_bos_sequence};
use crate::tensor::{concat_axis1, Tensor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Cooperative cancellation signal for a generation in progress.
///
/// Clones share the same flag. The generation loop polls it at the top of
/// every iteration and aborts with [`Error::Cancelled`]; the same token can
/// be wired to a Ctrl-C handler or a request-scoped guard.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Per-step progress callback: `(completed_step, max_steps)`, 1-based.
pub type StepCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Parameters for one generation call.
pub struct GenerateConfig {
    /// Noise scale for flow sampling. Zero makes decoding deterministic.
    pub temperature: f64,
    /// Raw logit threshold for EOS detection.
    pub eos_threshold: f64,
    /// Maximum autoregressive steps before a forced stop.
    pub max_steps: usize,
    /// Euler integration sub-steps per frame.
    pub lsd_decode_steps: usize,
    /// Extra frames to generate after the first EOS.
    pub frames_after_eos: usize,
    /// Optional voice conditioning `[1, T_voice, D]`, spliced before the
    /// text embeddings.
    pub voice_embedding: Option<Tensor>,
    /// Optional progress callback invoked after each completed step.
    pub step_callback: Option<StepCallback>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            eos_threshold: -4.0,
            max_steps: 256,
            lsd_decode_steps: 1,
            frames_after_eos: 0,
            voice_embedding: None,
            step_callback: None,
        }
    }
}

impl std::fmt::Debug for GenerateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateConfig")
            .field("temperature", &self.temperature)
            .field("eos_threshold", &self.eos_threshold)
            .field("max_steps", &self.max_steps)
            .field("lsd_decode_steps", &self.lsd_decode_steps)
            .field("frames_after_eos", &self.frames_after_eos)
            .field("voice_embedding", &self.voice_embedding.is_some())
            .field("step_callback", &self.step_callback.is_some())
            .finish()
    }
}

impl Engine {
    /// Run the full TTS pipeline and return 24 kHz float32 PCM samples.
    ///
    /// Dispatches to the stateful path (prefill plus per-step KV-cache) when
    /// the `flow_lm_prefill` graph is registered and falls back to the
    /// stateless replay path for older bundles. The choice is automatic,
    /// never configured.
    pub fn generate_audio(
        &self,
        cancel: &CancelToken,
        tokens: &[i64],
        cfg: &GenerateConfig,
    ) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(Error::InvalidInput(
                "generate: token slice must not be empty".to_string(),
            ));
        }

        if self.has_graph("flow_lm_prefill") {
            self.generate_audio_stateful(cancel, tokens, cfg)
        } else {
            self.generate_audio_stateless(cancel, tokens, cfg)
        }
    }

    /// Stateful path: prefill once, then advance an explicit KV-cache with
    /// only the newest frame each step.
    fn generate_audio_stateful(
        &self,
        cancel: &CancelToken,
        tokens: &[i64],
        cfg: &GenerateConfig,
    ) -> Result<Vec<f32>> {
        let text_emb = self.condition_text(tokens, cfg)?;

        let mut kv_state = self
            .flow_lm_prefill(&text_emb)
            .map_err(|e| Error::execution("generate: prefill", e))?;

        let mut current_frame = new_bos_sequence();
        let mut latent_frames: Vec<Tensor> = Vec::new();
        let mut eos_countdown: Option<usize> = None;

        for step in 0..cfg.max_steps {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let (last_hidden, eos_logits) = self
                .flow_lm_step_stateful(&current_frame, &mut kv_state)
                .map_err(|e| Error::execution(format!("generate step {step}"), e))?;

            if eos_countdown.is_none() && eos_detected(&eos_logits, cfg.eos_threshold) {
                debug!(step, frames_after_eos = cfg.frames_after_eos, "EOS detected");
                eos_countdown = Some(cfg.frames_after_eos);
            }

            let frame = self
                .flow_lm_flow(&last_hidden, cfg.temperature, cfg.lsd_decode_steps)
                .map_err(|e| Error::execution(format!("generate step {step} flow"), e))?;

            latent_frames.push(frame.clone());
            current_frame = frame;

            if let Some(callback) = &cfg.step_callback {
                callback(step + 1, cfg.max_steps);
            }

            if let Some(countdown) = &mut eos_countdown {
                if *countdown == 0 {
                    break;
                }
                *countdown -= 1;
            }
        }

        info!(frames = latent_frames.len(), "generation complete (stateful)");
        self.decode_latents_to_audio(&latent_frames)
    }

    /// Stateless fallback: replay the full growing latent sequence through
    /// `flow_lm_main` every step. Used for bundles without a prefill graph.
    fn generate_audio_stateless(
        &self,
        cancel: &CancelToken,
        tokens: &[i64],
        cfg: &GenerateConfig,
    ) -> Result<Vec<f32>> {
        let text_emb = self.condition_text(tokens, cfg)?;

        let mut sequence = new_bos_sequence();
        let mut latent_frames: Vec<Tensor> = Vec::new();
        let mut eos_countdown: Option<usize> = None;

        for step in 0..cfg.max_steps {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let (last_hidden, eos_logits) = self
                .flow_lm_step(&sequence, &text_emb)
                .map_err(|e| Error::execution(format!("generate step {step}"), e))?;

            if eos_countdown.is_none() && eos_detected(&eos_logits, cfg.eos_threshold) {
                debug!(step, frames_after_eos = cfg.frames_after_eos, "EOS detected");
                eos_countdown = Some(cfg.frames_after_eos);
            }

            let frame = self
                .flow_lm_flow(&last_hidden, cfg.temperature, cfg.lsd_decode_steps)
                .map_err(|e| Error::execution(format!("generate step {step} flow"), e))?;

            latent_frames.push(frame.clone());

            if let Some(callback) = &cfg.step_callback {
                callback(step + 1, cfg.max_steps);
            }

            if let Some(countdown) = &mut eos_countdown {
                if *countdown == 0 {
                    break;
                }
                *countdown -= 1;
            }

            sequence = append_latent_frame(&sequence, &frame)
                .map_err(|e| Error::execution(format!("generate step {step} append"), e))?;
        }

        info!(frames = latent_frames.len(), "generation complete (stateless)");
        self.decode_latents_to_audio(&latent_frames)
    }

    /// Text conditioning plus the optional voice-embedding splice.
    ///
    /// The voice tensor is concatenated before the text embeddings along
    /// axis 1, so every subsequent step sees the longer conditioning.
    fn condition_text(&self, tokens: &[i64], cfg: &GenerateConfig) -> Result<Tensor> {
        let text_emb = self
            .text_conditioner(tokens)
            .map_err(|e| Error::execution("generate", e))?;

        match &cfg.voice_embedding {
            Some(voice) => {
                let spliced = concat_axis1(voice, &text_emb)
                    .map_err(|e| Error::execution("generate: prepend voice embedding", e))?;
                debug!(
                    voice_frames = voice.shape()[1],
                    total_frames = spliced.shape()[1],
                    "voice conditioning applied"
                );
                Ok(spliced)
            }
            None => Ok(text_emb),
        }
    }

    /// Stack latent frames and run the two audio-decode graphs.
    fn decode_latents_to_audio(&self, latent_frames: &[Tensor]) -> Result<Vec<f32>> {
        let latent = stack_latent_frames(latent_frames)
            .map_err(|e| Error::execution("generate: stack latents", e))?;
        let mimi_latent = self
            .latent_to_mimi(&latent)
            .map_err(|e| Error::execution("generate", e))?;
        self.mimi_decode(&mimi_latent)
            .map_err(|e| Error::execution("generate", e))
    }
}

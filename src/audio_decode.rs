//! Latent stacking and the two-stage neural audio decode.
//!
//! Generated latent frames are stacked along the time axis, projected into
//! the Mimi codec's latent space, and decoded to 24 kHz PCM.

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::flow_lm::LATENT_DIM;
use crate::tensor::Tensor;
use std::collections::HashMap;

/// Output sample rate of the `mimi_decoder` graph.
pub const SAMPLE_RATE: u32 = 24_000;

/// Concatenate latent frames `[1, 1, 32]` into one `[1, S, 32]` tensor.
///
/// Zero frames is an error: an empty generation must fail loudly rather than
/// yield silent empty audio.
pub fn stack_latent_frames(frames: &[Tensor]) -> Result<Tensor> {
    if frames.is_empty() {
        return Err(Error::InvalidInput(
            "no latent frames to stack".to_string(),
        ));
    }

    let mut combined = Vec::with_capacity(frames.len() * LATENT_DIM);
    for (i, frame) in frames.iter().enumerate() {
        let data = frame
            .f32_data()
            .map_err(|e| Error::execution(format!("extract frame {i}"), e))?;
        combined.extend(data);
    }

    Tensor::from_f32(combined, &[1, frames.len() as i64, LATENT_DIM as i64])
}

impl Engine {
    /// Run the `latent_to_mimi` graph: `[1, S, 32]` in, `mimi_latent`
    /// `[1, 512, S]` out.
    pub fn latent_to_mimi(&self, latent: &Tensor) -> Result<Tensor> {
        let inputs = HashMap::from([("latent".to_string(), latent.clone())]);
        let outputs = self.run_graph("latent_to_mimi", &inputs)?;
        outputs
            .get("mimi_latent")
            .cloned()
            .ok_or_else(|| Error::MissingOutput {
                graph: "latent_to_mimi".to_string(),
                output: "mimi_latent".to_string(),
            })
    }

    /// Run the `mimi_decoder` graph and return flat PCM samples.
    pub fn mimi_decode(&self, mimi_latent: &Tensor) -> Result<Vec<f32>> {
        let inputs = HashMap::from([("latent".to_string(), mimi_latent.clone())]);
        let outputs = self.run_graph("mimi_decoder", &inputs)?;
        let audio = outputs.get("audio").ok_or_else(|| Error::MissingOutput {
            graph: "mimi_decoder".to_string(),
            output: "audio".to_string(),
        })?;
        audio
            .f32_data()
            .map_err(|e| Error::execution("mimi_decoder: extract audio", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_lm::new_bos_sequence;
    use crate::runner::{FnRunner, GraphRunner};
    use std::sync::Arc;

    #[test]
    fn stack_single_bos_frame_keeps_shape() {
        let stacked = stack_latent_frames(&[new_bos_sequence()]).unwrap();
        assert_eq!(stacked.shape(), vec![1, 1, LATENT_DIM as i64]);
        assert!(stacked.f32_data().unwrap().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn stack_preserves_frame_order() {
        let frames: Vec<Tensor> = (0..3)
            .map(|n| {
                Tensor::from_f32(vec![n as f32; LATENT_DIM], &[1, 1, LATENT_DIM as i64]).unwrap()
            })
            .collect();
        let stacked = stack_latent_frames(&frames).unwrap();
        assert_eq!(stacked.shape(), vec![1, 3, LATENT_DIM as i64]);
        let data = stacked.f32_data().unwrap();
        assert_eq!(data[0], 0.0);
        assert_eq!(data[LATENT_DIM], 1.0);
        assert_eq!(data[2 * LATENT_DIM], 2.0);
    }

    #[test]
    fn stack_zero_frames_is_an_error() {
        let err = stack_latent_frames(&[]).unwrap_err();
        assert!(err.to_string().contains("no latent frames"));
    }

    #[test]
    fn decode_stages_require_their_graphs_and_outputs() {
        let engine = Engine::with_runners(HashMap::new());
        let latent = new_bos_sequence();
        assert!(engine
            .latent_to_mimi(&latent)
            .unwrap_err()
            .to_string()
            .contains("latent_to_mimi"));
        assert!(engine
            .mimi_decode(&latent)
            .unwrap_err()
            .to_string()
            .contains("mimi_decoder"));

        let no_audio: Arc<dyn GraphRunner> =
            Arc::new(FnRunner::new("mimi_decoder", |_| Ok(HashMap::new())));
        let engine = Engine::with_runners(HashMap::from([(
            "mimi_decoder".to_string(),
            no_audio,
        )]));
        let err = engine.mimi_decode(&latent).unwrap_err();
        assert!(matches!(err, Error::MissingOutput { ref output, .. } if output == "audio"));
    }

    #[test]
    fn mimi_decode_returns_flat_pcm() {
        let decoder: Arc<dyn GraphRunner> = Arc::new(FnRunner::new("mimi_decoder", |inputs| {
            let frames = inputs["latent"].shape()[2];
            let samples = (frames * 480) as usize;
            let audio = Tensor::from_f32(vec![0.25; samples], &[1, 1, frames * 480])?;
            Ok(HashMap::from([("audio".to_string(), audio)]))
        }));
        let engine =
            Engine::with_runners(HashMap::from([("mimi_decoder".to_string(), decoder)]));

        let mimi_latent = Tensor::from_f32(vec![0.0; 512 * 2], &[1, 512, 2]).unwrap();
        let pcm = engine.mimi_decode(&mimi_latent).unwrap();
        assert_eq!(pcm.len(), 960);
        assert!(pcm.iter().all(|v| *v == 0.25));
    }
}

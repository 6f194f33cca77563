//! End-to-end generation tests over fake graph runners.
//!
//! These drive the full pipeline (conditioning, autoregressive loop, Euler
//! decode, audio decode) through closure-backed runners, covering both the
//! stateful KV-cache path and the stateless replay fallback.

use glor::{
    CancelToken, Engine, Error, FnRunner, GenerateConfig, GraphRunner, Tensor, LATENT_DIM,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const EMB_DIM: i64 = 1024;
const NUM_LAYERS: usize = 2;
const SAMPLES_PER_FRAME: i64 = 480;

/// Observable call counts from the fake graphs.
#[derive(Default)]
struct Counters {
    steps: AtomicUsize,
    /// Conditioning length seen by the first flow-LM invocation.
    conditioning_len: AtomicUsize,
}

fn runner(
    name: &str,
    f: impl Fn(&HashMap<String, Tensor>) -> glor::Result<HashMap<String, Tensor>>
        + Send
        + Sync
        + 'static,
) -> (String, Arc<dyn GraphRunner>) {
    (name.to_string(), Arc::new(FnRunner::new(name, f)))
}

fn text_conditioner() -> (String, Arc<dyn GraphRunner>) {
    runner("text_conditioner", |inputs| {
        let t = inputs["tokens"].shape()[1];
        let emb = Tensor::from_f32(vec![0.0; (t * EMB_DIM) as usize], &[1, t, EMB_DIM])?;
        Ok(HashMap::from([("text_embeddings".to_string(), emb)]))
    })
}

fn flow_runner() -> (String, Arc<dyn GraphRunner>) {
    runner("flow_lm_flow", |_| {
        let dir = Tensor::from_f32(vec![0.5; LATENT_DIM], &[1, LATENT_DIM as i64])?;
        Ok(HashMap::from([("flow_direction".to_string(), dir)]))
    })
}

fn latent_to_mimi() -> (String, Arc<dyn GraphRunner>) {
    runner("latent_to_mimi", |inputs| {
        let frames = inputs["latent"].shape()[1];
        let out = Tensor::from_f32(vec![0.0; (512 * frames) as usize], &[1, 512, frames])?;
        Ok(HashMap::from([("mimi_latent".to_string(), out)]))
    })
}

fn mimi_decoder() -> (String, Arc<dyn GraphRunner>) {
    runner("mimi_decoder", |inputs| {
        let frames = inputs["latent"].shape()[2];
        let samples = frames * SAMPLES_PER_FRAME;
        let audio = Tensor::from_f32(vec![0.1; samples as usize], &[1, 1, samples])?;
        Ok(HashMap::from([("audio".to_string(), audio)]))
    })
}

fn kv_outputs(cached: i64) -> glor::Result<HashMap<String, Tensor>> {
    let mut out = HashMap::new();
    for i in 0..NUM_LAYERS {
        let len = (2 * cached * 2 * 4) as usize;
        out.insert(
            format!("kv_{i}"),
            Tensor::from_f32(vec![0.0; len], &[2, 1, cached, 2, 4])?,
        );
    }
    out.insert("offset".to_string(), Tensor::from_i64(vec![cached], &[1])?);
    Ok(out)
}

/// Engine with the full stateful graph set. EOS fires once the step graph has
/// been invoked `eos_after` times (0 = never within any realistic run).
fn stateful_engine(eos_after: usize, counters: Arc<Counters>) -> Engine {
    let prefill = {
        let counters = counters.clone();
        runner("flow_lm_prefill", move |inputs| {
            let cond_len = inputs["text_embeddings"].shape()[1];
            counters
                .conditioning_len
                .store(cond_len as usize, Ordering::SeqCst);
            kv_outputs(cond_len)
        })
    };

    let step = {
        let counters = counters.clone();
        runner("flow_lm_step", move |inputs| {
            let count = counters.steps.fetch_add(1, Ordering::SeqCst) + 1;
            let offset = inputs["offset"].i64_data()?[0];
            let mut out = kv_outputs(offset + 1)?;
            out.insert(
                "last_hidden".to_string(),
                Tensor::from_f32(vec![0.0; EMB_DIM as usize], &[1, EMB_DIM])?,
            );
            let eos = if eos_after > 0 && count >= eos_after {
                0.0
            } else {
                -10.0
            };
            out.insert(
                "eos_logits".to_string(),
                Tensor::from_f32(vec![eos], &[1, 1])?,
            );
            Ok(out)
        })
    };

    Engine::with_runners(HashMap::from([
        text_conditioner(),
        prefill,
        step,
        flow_runner(),
        latent_to_mimi(),
        mimi_decoder(),
    ]))
}

/// Engine without a prefill graph, forcing the stateless replay path.
fn stateless_engine(eos_after: usize, counters: Arc<Counters>) -> Engine {
    let main = {
        let counters = counters.clone();
        runner("flow_lm_main", move |inputs| {
            let count = counters.steps.fetch_add(1, Ordering::SeqCst) + 1;
            if count == 1 {
                let cond_len = inputs["text_embeddings"].shape()[1];
                counters
                    .conditioning_len
                    .store(cond_len as usize, Ordering::SeqCst);
                // First call sees exactly the BOS sentinel.
                assert_eq!(inputs["sequence"].shape(), vec![1, 1, LATENT_DIM as i64]);
            } else {
                // The replayed sequence grows by one frame per step.
                assert_eq!(inputs["sequence"].shape()[1], count as i64);
            }

            let hidden = Tensor::from_f32(vec![0.0; EMB_DIM as usize], &[1, EMB_DIM])?;
            let eos = if eos_after > 0 && count >= eos_after {
                0.0
            } else {
                -10.0
            };
            Ok(HashMap::from([
                ("last_hidden".to_string(), hidden),
                (
                    "eos_logits".to_string(),
                    Tensor::from_f32(vec![eos], &[1, 1])?,
                ),
            ]))
        })
    };

    Engine::with_runners(HashMap::from([
        text_conditioner(),
        main,
        flow_runner(),
        latent_to_mimi(),
        mimi_decoder(),
    ]))
}

fn config(max_steps: usize, frames_after_eos: usize) -> GenerateConfig {
    GenerateConfig {
        temperature: 0.0,
        max_steps,
        frames_after_eos,
        ..GenerateConfig::default()
    }
}

#[test]
fn stateful_path_produces_pcm() {
    let counters = Arc::new(Counters::default());
    let engine = stateful_engine(3, counters.clone());

    let pcm = engine
        .generate_audio(&CancelToken::new(), &[1, 2, 3], &config(256, 0))
        .expect("stateful generation");

    // EOS at step 3 with no extra frames: 3 frames, 480 samples each.
    assert_eq!(counters.steps.load(Ordering::SeqCst), 3);
    assert_eq!(pcm.len(), 3 * SAMPLES_PER_FRAME as usize);
}

#[test]
fn stateless_path_produces_pcm() {
    let counters = Arc::new(Counters::default());
    let engine = stateless_engine(3, counters.clone());

    let pcm = engine
        .generate_audio(&CancelToken::new(), &[1, 2, 3], &config(256, 0))
        .expect("stateless generation");

    assert_eq!(counters.steps.load(Ordering::SeqCst), 3);
    assert_eq!(pcm.len(), 3 * SAMPLES_PER_FRAME as usize);
}

#[test]
fn loop_without_eos_runs_exactly_max_steps() {
    for make_engine in [stateful_engine, stateless_engine] {
        let counters = Arc::new(Counters::default());
        let engine = make_engine(0, counters.clone());

        let pcm = engine
            .generate_audio(&CancelToken::new(), &[1], &config(7, 0))
            .expect("generation");
        assert_eq!(counters.steps.load(Ordering::SeqCst), 7);
        assert_eq!(pcm.len(), 7 * SAMPLES_PER_FRAME as usize);
    }
}

#[test]
fn frames_after_eos_extends_generation() {
    // EOS first fires on step 2; with 3 extra frames the loop runs 5 steps.
    let counters = Arc::new(Counters::default());
    let engine = stateful_engine(2, counters.clone());

    let pcm = engine
        .generate_audio(&CancelToken::new(), &[1], &config(256, 3))
        .expect("generation");
    assert_eq!(counters.steps.load(Ordering::SeqCst), 5);
    assert_eq!(pcm.len(), 5 * SAMPLES_PER_FRAME as usize);
}

#[test]
fn max_steps_caps_eos_countdown() {
    let counters = Arc::new(Counters::default());
    let engine = stateful_engine(2, counters.clone());

    engine
        .generate_audio(&CancelToken::new(), &[1], &config(3, 100))
        .expect("generation");
    assert_eq!(counters.steps.load(Ordering::SeqCst), 3);
}

#[test]
fn voice_embedding_is_spliced_before_text() {
    let counters = Arc::new(Counters::default());
    let engine = stateful_engine(1, counters.clone());

    let voice = Tensor::from_f32(vec![0.0; (2 * EMB_DIM) as usize], &[1, 2, EMB_DIM]).unwrap();
    let cfg = GenerateConfig {
        voice_embedding: Some(voice),
        ..config(4, 0)
    };
    engine
        .generate_audio(&CancelToken::new(), &[1, 2, 3, 4, 5], &cfg)
        .expect("generation with voice");
    // 2 voice frames + 5 text frames reach the prefill graph.
    assert_eq!(counters.conditioning_len.load(Ordering::SeqCst), 7);

    let counters = Arc::new(Counters::default());
    let engine = stateful_engine(1, counters.clone());
    engine
        .generate_audio(&CancelToken::new(), &[1, 2, 3, 4, 5], &config(4, 0))
        .expect("generation without voice");
    assert_eq!(counters.conditioning_len.load(Ordering::SeqCst), 5);
}

#[test]
fn mismatched_voice_embedding_fails() {
    let engine = stateful_engine(1, Arc::new(Counters::default()));
    let voice = Tensor::from_f32(vec![0.0; 6], &[1, 2, 3]).unwrap();
    let cfg = GenerateConfig {
        voice_embedding: Some(voice),
        ..config(4, 0)
    };
    let err = engine
        .generate_audio(&CancelToken::new(), &[1], &cfg)
        .unwrap_err();
    assert!(err.to_string().contains("voice"));
}

#[test]
fn empty_tokens_are_rejected() {
    let engine = stateful_engine(1, Arc::new(Counters::default()));
    let err = engine
        .generate_audio(&CancelToken::new(), &[], &config(4, 0))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[test]
fn zero_max_steps_is_a_stacking_error() {
    let engine = stateful_engine(0, Arc::new(Counters::default()));
    let err = engine
        .generate_audio(&CancelToken::new(), &[1], &config(0, 0))
        .unwrap_err();
    assert!(err.to_string().contains("stack latents"));
}

#[test]
fn cancellation_aborts_before_any_step() {
    let counters = Arc::new(Counters::default());
    let engine = stateful_engine(0, counters.clone());

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = engine
        .generate_audio(&cancel, &[1], &config(256, 0))
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(counters.steps.load(Ordering::SeqCst), 0);
}

#[test]
fn cancellation_mid_generation_stops_the_loop() {
    let counters = Arc::new(Counters::default());
    let engine = stateless_engine(0, counters.clone());

    let cancel = CancelToken::new();
    let cancel_from_callback = cancel.clone();
    let cfg = GenerateConfig {
        step_callback: Some(Box::new(move |step, _max| {
            if step == 2 {
                cancel_from_callback.cancel();
            }
        })),
        ..config(256, 0)
    };

    let err = engine.generate_audio(&cancel, &[1], &cfg).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(counters.steps.load(Ordering::SeqCst), 2);
}

#[test]
fn step_callback_reports_progress() {
    let counters = Arc::new(Counters::default());
    let engine = stateful_engine(0, counters);

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_callback = seen.clone();
    let cfg = GenerateConfig {
        step_callback: Some(Box::new(move |step, max_steps| {
            assert_eq!(max_steps, 4);
            seen_in_callback.store(step, Ordering::SeqCst);
        })),
        ..config(4, 0)
    };
    engine
        .generate_audio(&CancelToken::new(), &[1], &cfg)
        .expect("generation");
    assert_eq!(seen.load(Ordering::SeqCst), 4);
}

#[test]
fn missing_decoder_graph_aborts_with_its_name() {
    let counters = Arc::new(Counters::default());
    let full = stateful_engine(1, counters);
    // Rebuild the registry without the mimi decoder.
    let mut runners: HashMap<String, Arc<dyn GraphRunner>> = HashMap::from([
        text_conditioner(),
        flow_runner(),
        latent_to_mimi(),
    ]);
    runners.insert(
        "flow_lm_prefill".to_string(),
        full.runner("flow_lm_prefill").unwrap().clone(),
    );
    runners.insert(
        "flow_lm_step".to_string(),
        full.runner("flow_lm_step").unwrap().clone(),
    );
    let engine = Engine::with_runners(runners);

    let err = engine
        .generate_audio(&CancelToken::new(), &[1], &config(2, 0))
        .unwrap_err();
    assert!(err.to_string().contains("mimi_decoder"));
}

#[test]
fn step_failure_aborts_with_iteration_index() {
    let counters = Arc::new(Counters::default());
    let failing_step = {
        let counters = counters.clone();
        runner("flow_lm_main", move |_| {
            let count = counters.steps.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= 3 {
                return Err(Error::InvalidInput("synthetic failure".to_string()));
            }
            Ok(HashMap::from([
                (
                    "last_hidden".to_string(),
                    Tensor::from_f32(vec![0.0; EMB_DIM as usize], &[1, EMB_DIM])?,
                ),
                (
                    "eos_logits".to_string(),
                    Tensor::from_f32(vec![-10.0], &[1, 1])?,
                ),
            ]))
        })
    };
    let engine = Engine::with_runners(HashMap::from([
        text_conditioner(),
        failing_step,
        flow_runner(),
        latent_to_mimi(),
        mimi_decoder(),
    ]));

    let err = engine
        .generate_audio(&CancelToken::new(), &[1], &config(256, 0))
        .unwrap_err();
    assert!(err.to_string().contains("generate step 2"));
    assert!(err.to_string().contains("synthetic failure"));
}

#[test]
fn nan_eos_logits_never_stop_generation() {
    let counters = Arc::new(Counters::default());
    let nan_step = {
        let counters = counters.clone();
        runner("flow_lm_main", move |_| {
            counters.steps.fetch_add(1, Ordering::SeqCst);
            Ok(HashMap::from([
                (
                    "last_hidden".to_string(),
                    Tensor::from_f32(vec![0.0; EMB_DIM as usize], &[1, EMB_DIM])?,
                ),
                (
                    "eos_logits".to_string(),
                    Tensor::from_f32(vec![f32::NAN], &[1, 1])?,
                ),
            ]))
        })
    };
    let engine = Engine::with_runners(HashMap::from([
        text_conditioner(),
        nan_step,
        flow_runner(),
        latent_to_mimi(),
        mimi_decoder(),
    ]));

    let cfg = GenerateConfig {
        // A threshold every finite logit would clear; NaN still must not.
        eos_threshold: f64::MIN,
        ..config(5, 0)
    };
    engine
        .generate_audio(&CancelToken::new(), &[1], &cfg)
        .expect("generation");
    assert_eq!(counters.steps.load(Ordering::SeqCst), 5);
}

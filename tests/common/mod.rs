//! Shared helpers for integration tests.
//!
//! Checkpoints are generated on the fly from a seeded RNG, so every test runs
//! against a real (if untrained) acoustic model without downloading weights.

#![allow(dead_code)]

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use cutie_tts::model::{parameter_shapes, AcousticConfig};
use cutie_tts::model_loader::write_checkpoint;
use cutie_tts::tokenizer::{TextTokenizer, MAX_TOKENS};
use cutie_tts::voices::{CloudVoice, LocalVoice, VoiceError};
use cutie_tts::wav::{Waveform, SAMPLE_RATE};
use cutie_tts::TtsError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn small_config() -> AcousticConfig {
    AcousticConfig {
        vocab_size: 128,
        hidden_dim: 16,
        num_heads: 4,
        speaker_slots: 100,
    }
}

/// Parameters drawn from `N(0, 0.1²)` with a fixed seed
pub fn random_tensors(config: &AcousticConfig, seed: u64) -> HashMap<String, Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    parameter_shapes(config)
        .into_iter()
        .map(|(name, shape)| {
            let n: usize = shape.iter().product();
            let values: Vec<f32> = (0..n)
                .map(|_| rng.sample::<f32, _>(StandardNormal) * 0.1)
                .collect();
            let tensor = Tensor::from_vec(values, shape, &Device::Cpu).unwrap();
            (name, tensor)
        })
        .collect()
}

/// Write `model.safetensors` and `config.json` into `dir`.
///
/// `stop_bias` overrides the stop head bias; a large positive value makes
/// the model stop after its first frame.
pub fn write_model(dir: &Path, config: &AcousticConfig, seed: u64, stop_bias: Option<f32>) -> PathBuf {
    let mut tensors = random_tensors(config, seed);
    if let Some(bias) = stop_bias {
        let t = Tensor::from_vec(vec![bias], 1, &Device::Cpu).unwrap();
        tensors.insert("stop_projection.bias".to_string(), t);
    }
    std::fs::write(
        dir.join("config.json"),
        serde_json::to_string_pretty(config).unwrap(),
    )
    .unwrap();
    let path = dir.join("model.safetensors");
    write_checkpoint(&path, &tensors, Some(config.vocab_size)).unwrap();
    path
}

/// One token per character, folded into the vocabulary
pub struct CharTokenizer {
    pub vocab_size: u32,
}

impl TextTokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, TtsError> {
        Ok(text
            .chars()
            .take(MAX_TOKENS)
            .map(|c| c as u32 % self.vocab_size)
            .collect())
    }
}

pub struct BrokenTokenizer;

impl TextTokenizer for BrokenTokenizer {
    fn encode(&self, _text: &str) -> Result<Vec<u32>, TtsError> {
        Err(TtsError::Tokenizer("vocabulary missing".to_string()))
    }
}

/// Host voice that always fails and counts its calls
#[derive(Default)]
pub struct FailingLocalVoice {
    pub calls: AtomicUsize,
}

#[async_trait]
impl LocalVoice for FailingLocalVoice {
    fn name(&self) -> &str {
        "failing-local"
    }

    async fn render(&self, _text: &str) -> Result<Waveform, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(VoiceError::Process("synthesizer crashed".to_string()))
    }
}

#[derive(Default)]
pub struct FailingCloudVoice {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CloudVoice for FailingCloudVoice {
    fn name(&self) -> &str {
        "failing-cloud"
    }

    async fn render(&self, _text: &str, _language: &str) -> Result<Waveform, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(VoiceError::Decode("service unavailable".to_string()))
    }
}

/// Host voice producing half a second of sine
pub struct SineLocalVoice;

#[async_trait]
impl LocalVoice for SineLocalVoice {
    fn name(&self) -> &str {
        "sine"
    }

    async fn render(&self, _text: &str) -> Result<Waveform, VoiceError> {
        let samples = (0..SAMPLE_RATE / 2)
            .map(|i| (i as f32 * 0.06).sin() * 0.5)
            .collect();
        Ok(Waveform::new(samples, SAMPLE_RATE))
    }
}

/// Host voice that never answers within a reasonable time
pub struct SlowLocalVoice {
    pub delay: Duration,
}

#[async_trait]
impl LocalVoice for SlowLocalVoice {
    fn name(&self) -> &str {
        "slow"
    }

    async fn render(&self, text: &str) -> Result<Waveform, VoiceError> {
        tokio::time::sleep(self.delay).await;
        SineLocalVoice.render(text).await
    }
}

pub fn char_tokenizer(config: &AcousticConfig) -> Arc<dyn TextTokenizer> {
    Arc::new(CharTokenizer {
        vocab_size: config.vocab_size as u32,
    })
}

pub mod audio_validation {
    use cutie_tts::wav::{read_wav, SAMPLE_RATE};
    use std::path::Path;

    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let s = samples.iter().map(|v| v * v).sum::<f32>() / samples.len() as f32;
        s.sqrt()
    }

    pub fn peak(samples: &[f32]) -> f32 {
        samples.iter().map(|v| v.abs()).fold(0.0f32, f32::max)
    }

    /// Assert `path` is a readable mono WAV at the engine rate; returns its samples.
    pub fn validate_wav_file(path: &Path) -> Vec<f32> {
        assert!(path.exists(), "missing audio file {}", path.display());
        let waveform = read_wav(path).unwrap();
        assert_eq!(waveform.sample_rate, SAMPLE_RATE);
        assert!(!waveform.samples.is_empty(), "audio is empty");
        for (i, &v) in waveform.samples.iter().enumerate() {
            assert!(v.is_finite(), "non-finite sample at {i}: {v}");
        }
        assert!(peak(&waveform.samples) <= 1.0);
        waveform.samples
    }
}

//! The individual levels of the fallback chain
//!
//! Each stage renders the already normalized text to a waveform and publishes
//! it with [`AudioArtifact::publish`], so a stage either leaves a validated
//! file at the output path or nothing at all.

use crate::config::DecodeConfig;
use crate::model::AcousticModel;
use crate::speakers::SpeakerRegistry;
use crate::tokenizer::TextTokenizer;
use crate::tone;
use crate::tts::{AudioArtifact, StageError, StageKind, TtsError};
use crate::vocoder::MelVocoder;
use crate::voices::{CloudVoice, LocalVoice};
use crate::wav::{Waveform, PEAK_HEADROOM};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Everything a stage needs to render one request
#[derive(Clone, Debug)]
pub struct StageJob {
    /// Normalized text
    pub text: String,
    pub speaker: String,
    pub output: PathBuf,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait SynthesisStage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn name(&self) -> String {
        self.kind().to_string()
    }

    /// Upper bound on [`SynthesisStage::run`], if any
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, job: &StageJob) -> Result<AudioArtifact, StageError>;
}

// ===== Neural =====

/// Tokenizer, acoustic model and vocoder wired together
pub struct NeuralPipeline {
    pub model: Arc<AcousticModel>,
    pub tokenizer: Arc<dyn TextTokenizer>,
    pub vocoder: Arc<MelVocoder>,
    pub registry: Arc<SpeakerRegistry>,
    pub decode: DecodeConfig,
    pub min_artifact_bytes: u64,
}

impl NeuralPipeline {
    /// Text to peak-normalized waveform. Blocking.
    pub fn render(&self, job: &StageJob) -> Result<Waveform, TtsError> {
        let speaker = self.registry.resolve(&job.speaker);
        let tokens = self.tokenizer.encode(&job.text)?;
        debug!(tokens = tokens.len(), speaker = %speaker, "tokenized");

        let started = Instant::now();
        let generation = self
            .model
            .generate(&tokens, speaker, &self.decode, &job.cancel)?;
        debug!(
            frames = generation.mel.len(),
            stopped = generation.stopped,
            "mel generated in {:?}",
            started.elapsed()
        );

        if job.cancel.is_cancelled() {
            return Err(TtsError::Cancelled);
        }
        let waveform = self
            .vocoder
            .mel_to_waveform_cancellable(&generation.mel, &job.cancel)?;
        Ok(waveform.peak_normalized(PEAK_HEADROOM))
    }
}

pub struct NeuralStage {
    pipeline: Arc<NeuralPipeline>,
}

impl NeuralStage {
    pub fn new(pipeline: Arc<NeuralPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl SynthesisStage for NeuralStage {
    fn kind(&self) -> StageKind {
        StageKind::Neural
    }

    #[instrument(skip_all, name = "neural_stage")]
    async fn run(&self, job: &StageJob) -> Result<AudioArtifact, StageError> {
        let pipeline = Arc::clone(&self.pipeline);
        let job = job.clone();
        // Outlives the awaiting caller on cancellation: never publish once the token fired.
        tokio::task::spawn_blocking(move || {
            let waveform = pipeline.render(&job)?;
            if job.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            AudioArtifact::publish(
                &job.output,
                &waveform,
                pipeline.min_artifact_bytes,
                StageKind::Neural,
            )
            .map_err(StageError::from)
        })
        .await
        .map_err(|e| StageError::Failed(format!("neural task panicked: {e}")))?
    }
}

// ===== External voices =====

pub struct LocalVoiceStage {
    voice: Arc<dyn LocalVoice>,
    timeout: Duration,
    min_artifact_bytes: u64,
}

impl LocalVoiceStage {
    pub fn new(voice: Arc<dyn LocalVoice>, timeout: Duration, min_artifact_bytes: u64) -> Self {
        Self {
            voice,
            timeout,
            min_artifact_bytes,
        }
    }
}

#[async_trait]
impl SynthesisStage for LocalVoiceStage {
    fn kind(&self) -> StageKind {
        StageKind::LocalVoice
    }

    fn name(&self) -> String {
        format!("{} ({})", self.kind(), self.voice.name())
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn run(&self, job: &StageJob) -> Result<AudioArtifact, StageError> {
        let waveform = self.voice.render(&job.text).await?;
        Ok(AudioArtifact::publish(
            &job.output,
            &waveform.peak_limited(PEAK_HEADROOM),
            self.min_artifact_bytes,
            StageKind::LocalVoice,
        )?)
    }
}

pub struct CloudVoiceStage {
    voice: Arc<dyn CloudVoice>,
    language: String,
    timeout: Duration,
    min_artifact_bytes: u64,
}

impl CloudVoiceStage {
    pub fn new(
        voice: Arc<dyn CloudVoice>,
        language: String,
        timeout: Duration,
        min_artifact_bytes: u64,
    ) -> Self {
        Self {
            voice,
            language,
            timeout,
            min_artifact_bytes,
        }
    }
}

#[async_trait]
impl SynthesisStage for CloudVoiceStage {
    fn kind(&self) -> StageKind {
        StageKind::CloudVoice
    }

    fn name(&self) -> String {
        format!("{} ({})", self.kind(), self.voice.name())
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn run(&self, job: &StageJob) -> Result<AudioArtifact, StageError> {
        let waveform = self.voice.render(&job.text, &self.language).await?;
        Ok(AudioArtifact::publish(
            &job.output,
            &waveform.peak_limited(PEAK_HEADROOM),
            self.min_artifact_bytes,
            StageKind::CloudVoice,
        )?)
    }
}

// ===== Tone =====

pub struct ToneStage {
    sample_rate: u32,
    min_artifact_bytes: u64,
}

impl ToneStage {
    pub fn new(sample_rate: u32, min_artifact_bytes: u64) -> Self {
        Self {
            sample_rate,
            min_artifact_bytes,
        }
    }
}

#[async_trait]
impl SynthesisStage for ToneStage {
    fn kind(&self) -> StageKind {
        StageKind::Tone
    }

    async fn run(&self, job: &StageJob) -> Result<AudioArtifact, StageError> {
        let samples = tone::character_tones(&job.text, self.sample_rate);
        let waveform = Waveform::new(samples, self.sample_rate);
        Ok(AudioArtifact::publish(
            &job.output,
            &waveform,
            self.min_artifact_bytes,
            StageKind::Tone,
        )?)
    }
}

//! Speech synthesis engine
//!
//! [`SpeechEngine`] turns a [`SynthesisRequest`] into a WAV file by walking an
//! ordered list of stages, from the neural acoustic model down to a tone
//! rendering, and stopping at the first one that produces a valid artifact.
//! When every stage fails a second of silence is written and the outcome is
//! flagged as a total failure.

use crate::config::{DecodeConfig, EngineConfig, FallbackConfig};
use crate::model::AcousticModel;
use crate::model_loader::{load_acoustic_model, CheckpointInfo, ModelLoaderError};
use crate::normalization::normalize;
use crate::speakers::{SpeakerRegistry, DEFAULT_SPEAKER};
use crate::stages::{
    CloudVoiceStage, LocalVoiceStage, NeuralPipeline, NeuralStage, StageJob, SynthesisStage,
    ToneStage,
};
use crate::tokenizer::{HfTokenizer, TextTokenizer};
use crate::tone;
use crate::vocoder::{MelVocoder, VocoderConfig, VocoderError};
use crate::voices::{CloudVoice, LocalVoice, SystemVoice, TranslateVoice, VoiceError};
use crate::wav::{write_wav_staged, WavError, Waveform};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Length of the last-resort silence, in seconds.
pub const SILENCE_SECS: f32 = 1.0;

// =============================================================================
// Error Types
// =============================================================================

/// Errors surfaced by the engine and its components
#[derive(Error, Debug, Clone)]
pub enum TtsError {
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Vocoder error: {0}")]
    Vocoder(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Voice collaborator error: {0}")]
    Collaborator(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("synthesis cancelled")]
    Cancelled,

    #[error("No audio could be produced: {0}")]
    TotalFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<candle_core::Error> for TtsError {
    fn from(err: candle_core::Error) -> Self {
        TtsError::Model(err.to_string())
    }
}

impl From<std::io::Error> for TtsError {
    fn from(err: std::io::Error) -> Self {
        TtsError::Io(err.to_string())
    }
}

impl From<WavError> for TtsError {
    fn from(err: WavError) -> Self {
        TtsError::Io(err.to_string())
    }
}

impl From<ModelLoaderError> for TtsError {
    fn from(err: ModelLoaderError) -> Self {
        TtsError::ModelUnavailable(err.to_string())
    }
}

impl From<VocoderError> for TtsError {
    fn from(err: VocoderError) -> Self {
        match err {
            VocoderError::Cancelled => TtsError::Cancelled,
            other => TtsError::Vocoder(other.to_string()),
        }
    }
}

impl From<VoiceError> for TtsError {
    fn from(err: VoiceError) -> Self {
        TtsError::Collaborator(err.to_string())
    }
}

/// Why a single stage did not produce an artifact
#[derive(Error, Debug, Clone)]
pub enum StageError {
    #[error("stage unavailable: {0}")]
    Unavailable(String),

    #[error("stage failed: {0}")]
    Failed(String),

    #[error("audio too small ({bytes} bytes, need more than {min})")]
    Undersized { bytes: u64, min: u64 },

    #[error("stage timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl From<TtsError> for StageError {
    fn from(err: TtsError) -> Self {
        match err {
            TtsError::Cancelled => StageError::Cancelled,
            TtsError::Timeout(d) => StageError::TimedOut(d),
            TtsError::ModelUnavailable(msg) => StageError::Unavailable(msg),
            other => StageError::Failed(other.to_string()),
        }
    }
}

impl From<WavError> for StageError {
    fn from(err: WavError) -> Self {
        match err {
            WavError::Undersized { bytes, min } => StageError::Undersized { bytes, min },
            other => StageError::Failed(other.to_string()),
        }
    }
}

impl From<VoiceError> for StageError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::Unavailable(msg) => StageError::Unavailable(msg),
            other => StageError::Failed(other.to_string()),
        }
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// One synthesis job
#[derive(Clone, Debug)]
pub struct SynthesisRequest {
    pub text: String,
    /// Speaker name, resolved case-insensitively
    pub speaker: String,
    /// Destination file; a fresh temporary path when `None`
    pub output_path: Option<PathBuf>,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            speaker: DEFAULT_SPEAKER.to_string(),
            output_path: None,
        }
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker = speaker.into();
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

/// Degradation level that produced an artifact
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Neural,
    LocalVoice,
    CloudVoice,
    Tone,
    Silence,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Neural => "neural",
            StageKind::LocalVoice => "local_voice",
            StageKind::CloudVoice => "cloud_voice",
            StageKind::Tone => "tone",
            StageKind::Silence => "silence",
        };
        write!(f, "{name}")
    }
}

/// A published WAV file
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AudioArtifact {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub num_samples: usize,
    pub duration_secs: f32,
    pub bytes: u64,
    pub stage: StageKind,
}

impl AudioArtifact {
    /// Write `waveform` to `path` atomically and describe the result.
    pub fn publish(
        path: &Path,
        waveform: &Waveform,
        min_bytes: u64,
        stage: StageKind,
    ) -> Result<Self, WavError> {
        let bytes = write_wav_staged(path, waveform, min_bytes)?;
        Ok(Self {
            path: path.to_path_buf(),
            sample_rate: waveform.sample_rate,
            num_samples: waveform.len(),
            duration_secs: waveform.duration_secs(),
            bytes,
            stage,
        })
    }
}

/// A stage that was tried and failed
#[derive(Clone, Debug, Serialize)]
pub struct StageFailure {
    pub stage: StageKind,
    pub error: String,
}

/// Result of [`SpeechEngine::synthesize`]
#[derive(Clone, Debug, Serialize)]
pub struct SynthesisOutcome {
    pub artifact: AudioArtifact,
    /// Every real stage failed and the artifact is silence
    pub total_failure: bool,
    pub failures: Vec<StageFailure>,
}

/// Which stages can run on this engine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EngineCapabilities {
    pub has_neural: bool,
    pub has_local_voice: bool,
    pub has_cloud_voice: bool,
}

/// Engine information
#[derive(Clone, Debug, Serialize)]
pub struct EngineInfo {
    pub name: String,
    pub version: String,
    pub sample_rate: u32,
    pub capabilities: EngineCapabilities,
    pub stages: Vec<StageKind>,
    pub speakers: usize,
    pub model: Option<String>,
    pub local_voice: Option<String>,
    pub cloud_voice: Option<String>,
}

// =============================================================================
// Engine
// =============================================================================

pub struct SpeechEngine {
    stages: Vec<Arc<dyn SynthesisStage>>,
    registry: Arc<SpeakerRegistry>,
    capabilities: EngineCapabilities,
    fallback: FallbackConfig,
    output_dir: PathBuf,
    sample_rate: u32,
    model_summary: Option<String>,
    local_voice_name: Option<String>,
    cloud_voice_name: Option<String>,
}

impl SpeechEngine {
    pub fn builder() -> SpeechEngineBuilder {
        SpeechEngineBuilder::new()
    }

    /// Build an engine from configuration, loading the checkpoint and
    /// detecting host voices. A missing or broken checkpoint only disables
    /// the neural stage.
    pub fn from_config(config: &EngineConfig) -> Result<Self, TtsError> {
        let mut builder = SpeechEngineBuilder::new()
            .with_decode_config(config.decode.clone())
            .with_vocoder_config(config.vocoder.clone())
            .with_fallback_config(config.fallback.clone())
            .with_output_dir(config.output_dir.clone());

        match load_neural_parts(config) {
            Ok((model, tokenizer, info)) => {
                builder = builder
                    .with_model(Arc::new(model))
                    .with_tokenizer(tokenizer)
                    .with_model_summary(format!(
                        "{} ({} parameters, vocab {})",
                        info.path.display(),
                        info.parameters,
                        info.config.vocab_size
                    ));
            }
            Err(e) => warn!("Neural synthesis disabled: {}", e),
        }

        if config.fallback.enable_local_voice {
            match SystemVoice::detect() {
                Some(voice) => {
                    let voice = voice
                        .with_rate(config.fallback.local_voice_rate)
                        .with_volume(config.fallback.local_voice_volume);
                    builder = builder.with_local_voice(Arc::new(voice));
                }
                None => debug!("No host speech synthesizer found"),
            }
        }

        if config.fallback.enable_cloud_voice {
            match TranslateVoice::new(config.fallback.collaborator_timeout) {
                Ok(voice) => builder = builder.with_cloud_voice(Arc::new(voice)),
                Err(e) => warn!("Network voice disabled: {}", e),
            }
        }

        builder.build()
    }

    pub fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    /// Known speaker names, sorted
    pub fn available_speakers(&self) -> Vec<String> {
        self.registry.list()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn info(&self) -> EngineInfo {
        EngineInfo {
            name: "cutie-tts".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            sample_rate: self.sample_rate,
            capabilities: self.capabilities,
            stages: self.stages.iter().map(|s| s.kind()).collect(),
            speakers: self.registry.len(),
            model: self.model_summary.clone(),
            local_voice: self.local_voice_name.clone(),
            cloud_voice: self.cloud_voice_name.clone(),
        }
    }

    fn fresh_output_path(&self) -> PathBuf {
        self.output_dir.join(format!("tts_{}.wav", Uuid::new_v4()))
    }

    /// Synthesize `request`, always producing a file unless cancelled or the
    /// output location is unwritable.
    pub async fn synthesize(
        &self,
        request: SynthesisRequest,
        cancel: &CancellationToken,
    ) -> Result<SynthesisOutcome, TtsError> {
        self.synthesize_with_progress(request, cancel, &|_| {}).await
    }

    /// Like [`SpeechEngine::synthesize`], reporting each step through `progress`.
    #[instrument(skip_all, fields(speaker = %request.speaker, chars = request.text.chars().count()))]
    pub async fn synthesize_with_progress(
        &self,
        request: SynthesisRequest,
        cancel: &CancellationToken,
        progress: &(dyn Fn(String) + Send + Sync),
    ) -> Result<SynthesisOutcome, TtsError> {
        let start = Instant::now();
        if cancel.is_cancelled() {
            return Err(TtsError::Cancelled);
        }

        let text = normalize(&request.text);
        let output = request
            .output_path
            .clone()
            .unwrap_or_else(|| self.fresh_output_path());
        debug!("Normalized text: {:?}", text);

        let job = StageJob {
            text,
            speaker: request.speaker,
            output,
            cancel: cancel.clone(),
        };

        let mut failures = Vec::new();
        for stage in &self.stages {
            if cancel.is_cancelled() {
                return Err(TtsError::Cancelled);
            }
            progress(format!("Generating audio ({})", stage.name()));

            match self.run_stage(stage.as_ref(), &job).await {
                Ok(artifact) => {
                    info!(
                        stage = %artifact.stage,
                        bytes = artifact.bytes,
                        "Synthesized {:.2}s of audio in {:?}",
                        artifact.duration_secs,
                        start.elapsed()
                    );
                    return Ok(SynthesisOutcome {
                        artifact,
                        total_failure: false,
                        failures,
                    });
                }
                Err(StageError::Cancelled) => return Err(TtsError::Cancelled),
                Err(e) => {
                    warn!(stage = %stage.kind(), "Stage failed, falling back: {}", e);
                    failures.push(StageFailure {
                        stage: stage.kind(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(TtsError::Cancelled);
        }
        progress("Writing silence".to_string());
        let silence = Waveform::new(tone::silence(self.sample_rate, SILENCE_SECS), self.sample_rate);
        let artifact = AudioArtifact::publish(&job.output, &silence, 0, StageKind::Silence)
            .map_err(|e| {
                error!("Could not write any audio to {:?}: {}", job.output, e);
                TtsError::TotalFailure(e.to_string())
            })?;
        error!("All synthesis stages failed, wrote silence to {:?}", artifact.path);
        Ok(SynthesisOutcome {
            artifact,
            total_failure: true,
            failures,
        })
    }

    async fn run_stage(
        &self,
        stage: &dyn SynthesisStage,
        job: &StageJob,
    ) -> Result<AudioArtifact, StageError> {
        let run = async {
            match stage.timeout() {
                Some(limit) => tokio::time::timeout(limit, stage.run(job))
                    .await
                    .unwrap_or(Err(StageError::TimedOut(limit))),
                None => stage.run(job).await,
            }
        };
        tokio::select! {
            _ = job.cancel.cancelled() => Err(StageError::Cancelled),
            result = run => result,
        }
    }
}

fn load_neural_parts(
    config: &EngineConfig,
) -> Result<(AcousticModel, Arc<dyn TextTokenizer>, CheckpointInfo), TtsError> {
    let checkpoint = config
        .checkpoint
        .as_ref()
        .ok_or_else(|| TtsError::ModelUnavailable("no checkpoint configured".to_string()))?;
    let tokenizer_path = config
        .tokenizer
        .as_ref()
        .ok_or_else(|| TtsError::ModelUnavailable("no tokenizer configured".to_string()))?;

    let (model, info) = load_acoustic_model(checkpoint, &config.device)?;
    let tokenizer = HfTokenizer::from_file(tokenizer_path)?;
    Ok((model, Arc::new(tokenizer), info))
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`SpeechEngine`]
pub struct SpeechEngineBuilder {
    model: Option<Arc<AcousticModel>>,
    tokenizer: Option<Arc<dyn TextTokenizer>>,
    local_voice: Option<Arc<dyn LocalVoice>>,
    cloud_voice: Option<Arc<dyn CloudVoice>>,
    registry: Option<Arc<SpeakerRegistry>>,
    decode: DecodeConfig,
    vocoder: VocoderConfig,
    fallback: FallbackConfig,
    output_dir: PathBuf,
    model_summary: Option<String>,
}

impl Default for SpeechEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechEngineBuilder {
    pub fn new() -> Self {
        Self {
            model: None,
            tokenizer: None,
            local_voice: None,
            cloud_voice: None,
            registry: None,
            decode: DecodeConfig::default(),
            vocoder: VocoderConfig::default(),
            fallback: FallbackConfig::default(),
            output_dir: std::env::temp_dir(),
            model_summary: None,
        }
    }

    pub fn with_model(mut self, model: Arc<AcousticModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn TextTokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_local_voice(mut self, voice: Arc<dyn LocalVoice>) -> Self {
        self.local_voice = Some(voice);
        self
    }

    pub fn with_cloud_voice(mut self, voice: Arc<dyn CloudVoice>) -> Self {
        self.cloud_voice = Some(voice);
        self
    }

    pub fn with_registry(mut self, registry: Arc<SpeakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_decode_config(mut self, config: DecodeConfig) -> Self {
        self.decode = config;
        self
    }

    pub fn with_vocoder_config(mut self, config: VocoderConfig) -> Self {
        self.vocoder = config;
        self
    }

    pub fn with_fallback_config(mut self, config: FallbackConfig) -> Self {
        self.fallback = config;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    fn with_model_summary(mut self, summary: String) -> Self {
        self.model_summary = Some(summary);
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<SpeechEngine, TtsError> {
        let vocoder = MelVocoder::new(self.vocoder)?;
        let sample_rate = vocoder.sample_rate();
        let registry = self.registry.unwrap_or_default();
        let fallback = self.fallback;
        let timeout = fallback.collaborator_timeout;
        let min_bytes = fallback.min_artifact_bytes;

        let mut stages: Vec<Arc<dyn SynthesisStage>> = Vec::new();
        let mut capabilities = EngineCapabilities::default();

        match (self.model, self.tokenizer) {
            (Some(model), Some(tokenizer)) => {
                let pipeline = NeuralPipeline {
                    model,
                    tokenizer,
                    vocoder: Arc::new(vocoder),
                    registry: Arc::clone(&registry),
                    decode: self.decode,
                    min_artifact_bytes: min_bytes,
                };
                stages.push(Arc::new(NeuralStage::new(Arc::new(pipeline))));
                capabilities.has_neural = true;
            }
            (Some(_), None) => warn!("Acoustic model given without a tokenizer, neural stage disabled"),
            _ => {}
        }

        let local_voice_name = self.local_voice.as_ref().map(|v| v.name().to_string());
        if let Some(voice) = self.local_voice {
            stages.push(Arc::new(LocalVoiceStage::new(voice, timeout, min_bytes)));
            capabilities.has_local_voice = true;
        }

        let cloud_voice_name = self.cloud_voice.as_ref().map(|v| v.name().to_string());
        if let Some(voice) = self.cloud_voice {
            stages.push(Arc::new(CloudVoiceStage::new(
                voice,
                fallback.language.clone(),
                timeout,
                min_bytes,
            )));
            capabilities.has_cloud_voice = true;
        }

        stages.push(Arc::new(ToneStage::new(sample_rate, min_bytes)));

        info!(
            neural = capabilities.has_neural,
            local_voice = capabilities.has_local_voice,
            cloud_voice = capabilities.has_cloud_voice,
            "Speech engine ready with {} stages",
            stages.len()
        );

        Ok(SpeechEngine {
            stages,
            registry,
            capabilities,
            fallback,
            output_dir: self.output_dir,
            sample_rate,
            model_summary: self.model_summary,
            local_voice_name,
            cloud_voice_name,
        })
    }
}

impl SpeechEngine {
    pub fn fallback_config(&self) -> &FallbackConfig {
        &self.fallback
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wav::{validate_artifact, MIN_ARTIFACT_BYTES, SAMPLE_RATE};

    fn tone_only_engine(dir: &Path) -> SpeechEngine {
        SpeechEngine::builder().with_output_dir(dir).build().unwrap()
    }

    #[test]
    fn test_request_builder() {
        let req = SynthesisRequest::new("Hello")
            .with_speaker("Paimon")
            .with_output_path("/tmp/out.wav");
        assert_eq!(req.text, "Hello");
        assert_eq!(req.speaker, "Paimon");
        assert_eq!(req.output_path, Some(PathBuf::from("/tmp/out.wav")));
        assert_eq!(SynthesisRequest::new("x").speaker, DEFAULT_SPEAKER);
    }

    #[test]
    fn test_error_conversions() {
        let candle_err = candle_core::Error::Msg("test".to_string());
        assert!(matches!(TtsError::from(candle_err), TtsError::Model(_)));

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        assert!(matches!(TtsError::from(io_err), TtsError::Io(_)));

        assert!(matches!(StageError::from(TtsError::Cancelled), StageError::Cancelled));
        assert!(matches!(TtsError::from(VocoderError::Cancelled), TtsError::Cancelled));
        assert!(matches!(
            TtsError::from(VocoderError::SingularFilterbank),
            TtsError::Vocoder(_)
        ));
        assert!(matches!(
            StageError::from(WavError::Undersized { bytes: 10, min: 1000 }),
            StageError::Undersized { bytes: 10, min: 1000 }
        ));
    }

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::Neural.to_string(), "neural");
        assert_eq!(StageKind::CloudVoice.to_string(), "cloud_voice");
        assert_eq!(serde_json::to_string(&StageKind::LocalVoice).unwrap(), "\"local_voice\"");
    }

    #[test]
    fn test_tone_only_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let engine = tone_only_engine(dir.path());
        assert_eq!(engine.capabilities(), EngineCapabilities::default());
        let info = engine.info();
        assert_eq!(info.stages, vec![StageKind::Tone]);
        assert_eq!(info.sample_rate, SAMPLE_RATE);
        assert!(info.model.is_none());
        assert!(engine.available_speakers().contains(&"paimon".to_string()));
    }

    #[tokio::test]
    async fn test_tone_fallback_writes_default_path() {
        let dir = tempfile::tempdir().unwrap();
        let engine = tone_only_engine(dir.path());
        let outcome = engine
            .synthesize(SynthesisRequest::new("Hi"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.artifact.stage, StageKind::Tone);
        assert!(!outcome.total_failure);
        assert_eq!(outcome.artifact.path.parent(), Some(dir.path()));
        let name = outcome.artifact.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tts_") && name.ends_with(".wav"));
        assert!(validate_artifact(&outcome.artifact.path, MIN_ARTIFACT_BYTES).is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let engine = tone_only_engine(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let path = dir.path().join("never.wav");
        let err = engine
            .synthesize(SynthesisRequest::new("Hello").with_output_path(&path), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TtsError::Cancelled));
        assert!(!path.exists());
    }
}

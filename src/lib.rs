pub mod cli_style;
pub mod config;
pub mod mel;
pub mod model;
pub mod model_loader;
pub mod normalization;
pub mod speakers;
pub mod spectral;
pub mod stages;
pub mod tokenizer;
pub mod tone;
pub mod tts;
pub mod vocoder;
pub mod voices;
pub mod wav;
pub mod worker;

pub use config::{Cli, Commands, DecodeConfig, EngineConfig, FallbackConfig, GenerateArgs};
pub use mel::{AttentionTrace, MelSequence, MEL_CHANNELS};
pub use model::{AcousticConfig, AcousticModel, Generation};
pub use model_loader::{load_acoustic_model, CheckpointInfo, ModelLoaderError};
pub use speakers::{SpeakerId, SpeakerRegistry};
pub use stages::SynthesisStage;
pub use tokenizer::{HfTokenizer, TextTokenizer};
pub use tts::{
    AudioArtifact, EngineCapabilities, EngineInfo, SpeechEngine, SpeechEngineBuilder, StageError,
    StageKind, SynthesisOutcome, SynthesisRequest, TtsError,
};
pub use vocoder::{MelVocoder, VocoderConfig};
pub use voices::{CloudVoice, LocalVoice};
pub use wav::Waveform;
pub use worker::{SynthesisWorker, WorkerEvent, WorkerHandle};

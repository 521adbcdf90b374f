//! Configuration and CLI for the cutie-tts engine

use crate::vocoder::VocoderConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments with subcommands
#[derive(Parser, Debug, Clone)]
#[command(name = "cutie-tts")]
#[command(about = "Text to speech with a neural decoder and a fallback chain that always produces audio")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "CUTIE_TTS_LOG", default_value = "info", global = true)]
    pub log: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Synthesize text to a WAV file
    Generate(GenerateArgs),
    /// List known speaker names
    Speakers,
    /// Show which synthesis stages are available on this host
    Info(ModelArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Acoustic model checkpoint (.safetensors)
    #[arg(short, long, env = "CUTIE_TTS_MODEL")]
    pub model_path: Option<PathBuf>,

    /// Tokenizer definition (tokenizer.json)
    #[arg(long, env = "CUTIE_TTS_TOKENIZER")]
    pub tokenizer: Option<PathBuf>,

    /// Device to use (cpu, cuda, metal)
    #[arg(short, long, env = "CUTIE_TTS_DEVICE", default_value = "cpu")]
    pub device: String,

    /// Skip the host speech voice stage
    #[arg(long)]
    pub no_local_voice: bool,

    /// Skip the network speech voice stage
    #[arg(long)]
    pub no_cloud_voice: bool,

    /// Timeout for each external voice stage, in seconds
    #[arg(long, default_value_t = 10)]
    pub voice_timeout: u64,

    /// Language passed to the network voice
    #[arg(long, default_value = "en")]
    pub language: String,
}

impl ModelArgs {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.model_path
            .clone()
            .unwrap_or_else(|| default_model_dir().join("model.safetensors"))
    }

    pub fn tokenizer_path(&self) -> PathBuf {
        self.tokenizer
            .clone()
            .unwrap_or_else(|| default_model_dir().join("tokenizer.json"))
    }

    /// Engine configuration described by these arguments
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            checkpoint: Some(self.checkpoint_path()),
            tokenizer: Some(self.tokenizer_path()),
            device: parse_device(&self.device),
            fallback: FallbackConfig {
                collaborator_timeout: Duration::from_secs(self.voice_timeout.max(1)),
                language: self.language.clone(),
                enable_local_voice: !self.no_local_voice,
                enable_cloud_voice: !self.no_cloud_voice,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    /// Text to synthesize
    #[arg(short, long)]
    pub text: String,

    /// Speaker name (unknown names use the default voice)
    #[arg(short, long, default_value = "default")]
    pub speaker: String,

    /// Output WAV file (a temporary file when omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub model: ModelArgs,
}

/// Autoregressive decoding limits
#[derive(Clone, Debug, PartialEq)]
pub struct DecodeConfig {
    /// Decoding stops once `sigmoid(stop_logit)` exceeds this value
    pub stop_threshold: f32,
    /// Hard cap on generated frames
    pub max_frames_cap: usize,
    /// Frame budget per input token
    pub frames_per_token: usize,
    /// Seed for the noise frame emitted when nothing was generated
    pub safety_seed: u64,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            stop_threshold: 0.5,
            max_frames_cap: 1000,
            frames_per_token: 10,
            safety_seed: 0,
        }
    }
}

impl DecodeConfig {
    /// Frame budget for an input of `token_len` tokens
    pub fn max_frames(&self, token_len: usize) -> usize {
        self.max_frames_cap
            .min(token_len.saturating_mul(self.frames_per_token))
    }
}

/// Settings for the stages after the neural path
#[derive(Clone, Debug)]
pub struct FallbackConfig {
    /// Per-stage limit for external voices
    pub collaborator_timeout: Duration,
    /// Artifacts at or below this size count as failures
    pub min_artifact_bytes: u64,
    /// Language code for the network voice
    pub language: String,
    pub enable_local_voice: bool,
    pub enable_cloud_voice: bool,
    /// Speaking rate for the host voice, words per minute
    pub local_voice_rate: u32,
    /// Host voice volume in `0.0..=1.0`
    pub local_voice_volume: f32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            collaborator_timeout: Duration::from_secs(10),
            min_artifact_bytes: crate::wav::MIN_ARTIFACT_BYTES,
            language: "en".to_string(),
            enable_local_voice: true,
            enable_cloud_voice: true,
            local_voice_rate: 150,
            local_voice_volume: 0.9,
        }
    }
}

/// Everything needed to build a [`crate::SpeechEngine`]
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Acoustic model checkpoint; `None` disables the neural stage
    pub checkpoint: Option<PathBuf>,
    /// Tokenizer definition; the neural stage needs one
    pub tokenizer: Option<PathBuf>,
    pub device: candle_core::Device,
    pub decode: DecodeConfig,
    pub vocoder: VocoderConfig,
    pub fallback: FallbackConfig,
    /// Directory for outputs of requests without a path
    pub output_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint: None,
            tokenizer: None,
            device: candle_core::Device::Cpu,
            decode: DecodeConfig::default(),
            vocoder: VocoderConfig::default(),
            fallback: FallbackConfig::default(),
            output_dir: std::env::temp_dir(),
        }
    }
}

/// Where checkpoints live when no path is given
pub fn default_model_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("cutie-tts")
        .join("models")
}

/// Initialize tracing with given log level
pub fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Load environment variables from .env file
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

/// Get device from string, falling back to CPU when the backend is unavailable
pub fn parse_device(device_str: &str) -> candle_core::Device {
    match device_str.to_lowercase().as_str() {
        "cuda" | "gpu" => candle_core::Device::new_cuda(0).unwrap_or(candle_core::Device::Cpu),
        "metal" | "mps" => candle_core::Device::new_metal(0).unwrap_or(candle_core::Device::Cpu),
        _ => candle_core::Device::Cpu,
    }
}

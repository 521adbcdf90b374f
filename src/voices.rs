//! External speech voices used when the neural path is unavailable
//!
//! - [`SystemVoice`]: a host speech synthesizer run as a subprocess
//!   (espeak-ng, espeak, or macOS `say`)
//! - [`TranslateVoice`]: an HTTP text-to-speech endpoint returning MP3
//!
//! Both hand back a [`Waveform`] at the engine sample rate; decoding goes
//! through symphonia and rate conversion through rubato.

use crate::wav::{read_wav, WavError, Waveform, SAMPLE_RATE};
use async_trait::async_trait;
use rubato::{FftFixedIn, Resampler};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Longest text sent in one request to the network voice.
pub const MAX_REQUEST_CHARS: usize = 100;

const TRANSLATE_TTS_ENDPOINT: &str = "https://translate.google.com/translate_tts";
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("voice engine not available: {0}")]
    Unavailable(String),

    #[error("voice process failed: {0}")]
    Process(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("audio decode error: {0}")]
    Decode(String),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wav(#[from] WavError),
}

/// Speech synthesizer installed on the host
#[async_trait]
pub trait LocalVoice: Send + Sync {
    fn name(&self) -> &str;

    async fn render(&self, text: &str) -> Result<Waveform, VoiceError>;
}

/// Speech synthesizer reached over the network
#[async_trait]
pub trait CloudVoice: Send + Sync {
    fn name(&self) -> &str;

    async fn render(&self, text: &str, language: &str) -> Result<Waveform, VoiceError>;
}

// ===== Host voice =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemVoiceKind {
    EspeakNg,
    Espeak,
    Say,
}

impl SystemVoiceKind {
    pub fn binary(&self) -> &'static str {
        match self {
            SystemVoiceKind::EspeakNg => "espeak-ng",
            SystemVoiceKind::Espeak => "espeak",
            SystemVoiceKind::Say => "say",
        }
    }
}

/// Find `bin` as a path or on `PATH`
pub fn find_binary(bin: &str) -> Option<PathBuf> {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let p = PathBuf::from(bin);
        return if p.is_file() { Some(p) } else { None };
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}

/// Host synthesizer invoked as a subprocess writing a WAV file
#[derive(Debug, Clone)]
pub struct SystemVoice {
    kind: SystemVoiceKind,
    bin: PathBuf,
    /// Words per minute
    rate: u32,
    /// `0.0..=1.0`
    volume: f32,
}

impl SystemVoice {
    pub fn new(kind: SystemVoiceKind, bin: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            bin: bin.into(),
            rate: 150,
            volume: 0.9,
        }
    }

    /// First supported synthesizer found on this host
    pub fn detect() -> Option<Self> {
        let voice = [
            SystemVoiceKind::EspeakNg,
            SystemVoiceKind::Espeak,
            SystemVoiceKind::Say,
        ]
        .into_iter()
        .find_map(|kind| find_binary(kind.binary()).map(|bin| Self::new(kind, bin)));
        if let Some(v) = &voice {
            info!("Detected host voice {:?} at {:?}", v.kind, v.bin);
        }
        voice
    }

    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume.clamp(0.0, 1.0);
        self
    }

    pub fn kind(&self) -> SystemVoiceKind {
        self.kind
    }

    fn command(&self, text_file: &Path, wav_file: &Path) -> Command {
        let mut cmd = Command::new(&self.bin);
        match self.kind {
            SystemVoiceKind::EspeakNg | SystemVoiceKind::Espeak => {
                let amplitude = (self.volume * 100.0).round() as u32;
                cmd.arg("-s")
                    .arg(self.rate.to_string())
                    .arg("-a")
                    .arg(amplitude.to_string())
                    .arg("-w")
                    .arg(wav_file)
                    .arg("-f")
                    .arg(text_file);
            }
            SystemVoiceKind::Say => {
                cmd.arg("-r")
                    .arg(self.rate.to_string())
                    .arg("--file-format=WAVE")
                    .arg(format!("--data-format=LEI16@{SAMPLE_RATE}"))
                    .arg("-o")
                    .arg(wav_file)
                    .arg("-f")
                    .arg(text_file);
            }
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl LocalVoice for SystemVoice {
    fn name(&self) -> &str {
        self.kind.binary()
    }

    async fn render(&self, text: &str) -> Result<Waveform, VoiceError> {
        let scratch = tempfile::tempdir()?;
        let text_file = scratch.path().join("input.txt");
        let wav_file = scratch.path().join("speech.wav");
        tokio::fs::write(&text_file, text).await?;

        let output = self.command(&text_file, &wav_file).output().await?;
        if !output.status.success() {
            return Err(VoiceError::Process(format!(
                "{} exited with {}: {}",
                self.name(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if !wav_file.exists() {
            return Err(VoiceError::Process(format!("{} wrote no audio", self.name())));
        }

        let waveform = read_wav(&wav_file)?;
        debug!(
            samples = waveform.len(),
            sample_rate = waveform.sample_rate,
            "host voice rendered"
        );
        resample(&waveform.samples, waveform.sample_rate, SAMPLE_RATE)
    }
}

// ===== Network voice =====

/// Split `text` into pieces of at most `max_chars` characters, breaking at
/// whitespace where possible.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            chunks.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
            continue;
        }
        let needed = if current.is_empty() { word_len } else { current_len + 1 + word_len };
        if needed > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Google Translate speech endpoint
#[derive(Debug, Clone)]
pub struct TranslateVoice {
    client: reqwest::Client,
    endpoint: String,
}

impl TranslateVoice {
    pub fn new(timeout: Duration) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: TRANSLATE_TTS_ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn fetch_chunk(
        &self,
        chunk: &str,
        language: &str,
        idx: usize,
        total: usize,
    ) -> Result<Vec<u8>, VoiceError> {
        let total = total.to_string();
        let idx = idx.to_string();
        let textlen = chunk.chars().count().to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("ie", "UTF-8"),
                ("q", chunk),
                ("tl", language),
                ("total", total.as_str()),
                ("idx", idx.as_str()),
                ("textlen", textlen.as_str()),
                ("client", "tw-ob"),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl CloudVoice for TranslateVoice {
    fn name(&self) -> &str {
        "translate-tts"
    }

    async fn render(&self, text: &str, language: &str) -> Result<Waveform, VoiceError> {
        let chunks = chunk_text(text, MAX_REQUEST_CHARS);
        if chunks.is_empty() {
            return Err(VoiceError::Decode("no text to send".to_string()));
        }

        let mut mp3 = Vec::new();
        for (idx, chunk) in chunks.iter().enumerate() {
            mp3.extend(self.fetch_chunk(chunk, language, idx, chunks.len()).await?);
        }
        debug!(chunks = chunks.len(), bytes = mp3.len(), "network voice fetched");

        let (samples, sample_rate) = decode_audio(mp3, Some("mp3"))?;
        resample(&samples, sample_rate, SAMPLE_RATE)
    }
}

// ===== Transcoding =====

/// Decode an encoded audio stream (MP3, WAV) to mono f32 samples.
pub fn decode_audio(bytes: Vec<u8>, extension: Option<&str>) -> Result<(Vec<f32>, u32), VoiceError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| VoiceError::Decode(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| VoiceError::Decode("no supported audio track".to_string()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| VoiceError::Decode(format!("unsupported codec: {e}")))?;

    let mut pcm = Vec::new();
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(buf) => buf,
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(VoiceError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        let channels = spec.channels.count().max(1);
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        pcm.extend(
            buf.samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32),
        );
    }

    if pcm.is_empty() || sample_rate == 0 {
        return Err(VoiceError::Decode("stream contained no audio".to_string()));
    }
    Ok((pcm, sample_rate))
}

/// Convert mono samples from `sr_in` to `sr_out`.
pub fn resample(input: &[f32], sr_in: u32, sr_out: u32) -> Result<Waveform, VoiceError> {
    if sr_in == sr_out || input.is_empty() {
        return Ok(Waveform::new(input.to_vec(), sr_out));
    }
    if sr_in == 0 {
        return Err(VoiceError::Resample("input sample rate is zero".to_string()));
    }

    let mut resampler = FftFixedIn::<f32>::new(sr_in as usize, sr_out as usize, RESAMPLE_CHUNK, 2, 1)
        .map_err(|e| VoiceError::Resample(e.to_string()))?;
    let expected = (input.len() as f64 * sr_out as f64 / sr_in as f64).round() as usize;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut chunks = input.chunks_exact(RESAMPLE_CHUNK);
    for chunk in chunks.by_ref() {
        let frames = resampler
            .process(&[chunk], None)
            .map_err(|e| VoiceError::Resample(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let frames = resampler
            .process_partial(Some(&[tail]), None)
            .map_err(|e| VoiceError::Resample(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
    }
    while out.len() < expected + delay {
        let frames = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| VoiceError::Resample(e.to_string()))?;
        if frames[0].is_empty() {
            break;
        }
        out.extend_from_slice(&frames[0]);
    }

    let samples: Vec<f32> = out.into_iter().skip(delay).take(expected).collect();
    Ok(Waveform::new(samples, sr_out))
}

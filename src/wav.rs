//! Waveform buffers and WAV file output
//!
//! Every artifact is written through [`write_wav_staged`]: samples go to a
//! hidden temporary file next to the destination, the result is size-checked,
//! and only then renamed into place. A failed or undersized write never leaves
//! anything at the destination path.

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs;
use std::io::BufWriter;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Output sample rate of the engine.
pub const SAMPLE_RATE: u32 = 22050;

/// Peak amplitude of normalized output.
pub const PEAK_HEADROOM: f32 = 0.8;

/// Files at or below this size are treated as failed renders.
pub const MIN_ARTIFACT_BYTES: u64 = 1000;

#[derive(Error, Debug)]
pub enum WavError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV encoding error: {0}")]
    Encoding(#[from] hound::Error),

    #[error("audio file is too small ({bytes} bytes, need more than {min})")]
    Undersized { bytes: u64, min: u64 },

    #[error("audio file does not exist: {0}")]
    Missing(String),

    #[error("waveform has no samples")]
    Empty,
}

/// Mono floating point samples at a fixed rate
#[derive(Clone, Debug, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
    }

    /// Scale so the loudest sample sits exactly at `target`. Silence is left as is.
    pub fn peak_normalized(mut self, target: f32) -> Self {
        let peak = self.peak();
        if peak > 0.0 && peak.is_finite() {
            let scale = target / peak;
            self.samples.iter_mut().for_each(|s| *s *= scale);
        }
        self
    }

    /// Scale down only when the loudest sample exceeds `ceiling`.
    pub fn peak_limited(self, ceiling: f32) -> Self {
        if self.peak() > ceiling {
            self.peak_normalized(ceiling)
        } else {
            self
        }
    }

    /// Samples as 16-bit PCM with saturation
    pub fn pcm_i16(&self) -> Vec<i16> {
        self.samples
            .iter()
            .map(|&s| {
                let v = (s.clamp(-1.0, 1.0) * 32768.0).round() as i32;
                v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
            })
            .collect()
    }
}

fn wav_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Write `waveform` as 16-bit mono WAV at `path`, atomically.
///
/// Returns the size of the published file. Fails with
/// [`WavError::Undersized`] when the encoded file is not larger than
/// `min_bytes`, in which case nothing is written at `path`.
pub fn write_wav_staged(path: &Path, waveform: &Waveform, min_bytes: u64) -> Result<u64, WavError> {
    if waveform.is_empty() {
        return Err(WavError::Empty);
    }
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut staged = tempfile::Builder::new()
        .prefix(".tts-")
        .suffix(".wav.part")
        .tempfile_in(dir)?;

    {
        let mut writer = WavWriter::new(
            BufWriter::new(staged.as_file_mut()),
            wav_spec(waveform.sample_rate),
        )?;
        for sample in waveform.pcm_i16() {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    let bytes = staged.as_file().metadata()?.len();
    if bytes <= min_bytes {
        return Err(WavError::Undersized {
            bytes,
            min: min_bytes,
        });
    }

    staged.persist(path).map_err(|e| WavError::Io(e.error))?;
    debug!(path = %path.display(), bytes, "published wav");
    Ok(bytes)
}

/// Check that `path` exists and is larger than `min_bytes`; returns its size.
pub fn validate_artifact(path: &Path, min_bytes: u64) -> Result<u64, WavError> {
    let meta = fs::metadata(path).map_err(|_| WavError::Missing(path.display().to_string()))?;
    let bytes = meta.len();
    if bytes <= min_bytes {
        return Err(WavError::Undersized {
            bytes,
            min: min_bytes,
        });
    }
    Ok(bytes)
}

/// Read a WAV file as mono f32, averaging channels when there are several.
pub fn read_wav(path: &Path) -> Result<Waveform, WavError> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok(Waveform::new(samples, spec.sample_rate))
}

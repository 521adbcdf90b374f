//! Spectral operations for the Griffin-Lim vocoder
//!
//! Short-time Fourier transform and its inverse over `realfft`, using a
//! periodic Hann window and centred frames with reflect padding. Spectrograms
//! are frame-major: `spec[frame][bin]` with `n_fft / 2 + 1` bins per frame.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex32;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpectralError {
    #[error("invalid transform size: n_fft={n_fft}, hop={hop}")]
    InvalidSize { n_fft: usize, hop: usize },

    #[error("expected {expected} frequency bins, got {actual}")]
    BinMismatch { expected: usize, actual: usize },

    #[error("signal is empty")]
    EmptySignal,

    #[error("signal of {len} samples is too short to reflect-pad by {pad}")]
    TooShort { len: usize, pad: usize },

    #[error("reconstruction cancelled")]
    Cancelled,

    #[error("fft failed: {0}")]
    Fft(String),
}

/// Periodic Hann window, equal to `torch.hann_window(n)`
pub fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n as f32).cos()))
        .collect()
}

/// Fold an index that runs past either end back into `0..len` by mirroring
/// around the edge samples (numpy/torch `reflect` mode).
fn reflect_index(idx: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let m = idx.rem_euclid(period);
    if m >= len as isize {
        (period - m) as usize
    } else {
        m as usize
    }
}

/// Planned forward and inverse real FFTs for one `(n_fft, hop)` pair
pub struct StftPlan {
    n_fft: usize,
    hop_length: usize,
    window: Vec<f32>,
    window_sq: Vec<f32>,
    rfft: Arc<dyn RealToComplex<f32>>,
    irfft: Arc<dyn ComplexToReal<f32>>,
}

impl std::fmt::Debug for StftPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StftPlan")
            .field("n_fft", &self.n_fft)
            .field("hop_length", &self.hop_length)
            .finish()
    }
}

impl StftPlan {
    pub fn new(n_fft: usize, hop_length: usize) -> Result<Self, SpectralError> {
        if n_fft < 2 || n_fft % 2 != 0 || hop_length == 0 || hop_length > n_fft {
            return Err(SpectralError::InvalidSize {
                n_fft,
                hop: hop_length,
            });
        }
        let window = hann_window(n_fft);
        let window_sq = window.iter().map(|v| v * v).collect();

        let mut planner = RealFftPlanner::<f32>::new();
        let rfft = planner.plan_fft_forward(n_fft);
        let irfft = planner.plan_fft_inverse(n_fft);

        Ok(Self {
            n_fft,
            hop_length,
            window,
            window_sq,
            rfft,
            irfft,
        })
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn hop_length(&self) -> usize {
        self.hop_length
    }

    /// Frequency bins per frame
    pub fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Signal length produced by [`Self::istft`] for `frames` frames
    pub fn signal_len(&self, frames: usize) -> usize {
        frames.saturating_sub(1) * self.hop_length
    }

    /// Centred STFT with reflect padding of `n_fft / 2` on both sides.
    ///
    /// Reflection needs more samples than the pad width, so shorter signals
    /// are rejected.
    pub fn stft(&self, signal: &[f32]) -> Result<Vec<Vec<Complex32>>, SpectralError> {
        if signal.is_empty() {
            return Err(SpectralError::EmptySignal);
        }
        let pad = self.n_fft / 2;
        if signal.len() <= pad {
            return Err(SpectralError::TooShort {
                len: signal.len(),
                pad,
            });
        }
        let padded_len = signal.len() + 2 * pad;
        let n_frames = 1 + (padded_len - self.n_fft) / self.hop_length;

        let mut frame = vec![0.0f32; self.n_fft];
        let mut spectrum = self.rfft.make_output_vec();
        let mut out = Vec::with_capacity(n_frames);

        for ti in 0..n_frames {
            let start = (ti * self.hop_length) as isize - pad as isize;
            for (wi, slot) in frame.iter_mut().enumerate() {
                let src = reflect_index(start + wi as isize, signal.len());
                *slot = signal[src] * self.window[wi];
            }
            self.rfft
                .process(&mut frame, &mut spectrum)
                .map_err(|e| SpectralError::Fft(e.to_string()))?;
            out.push(spectrum.clone());
        }

        Ok(out)
    }

    /// Inverse of [`Self::stft`]: overlap-add of windowed frames divided by the
    /// squared-window envelope, trimmed to `length` samples after the centre pad.
    pub fn istft(&self, spec: &[Vec<Complex32>], length: usize) -> Result<Vec<f32>, SpectralError> {
        let n_bins = self.bins();
        let n_frames = spec.len();
        let full_len = self.n_fft + self.hop_length * n_frames.saturating_sub(1);

        let mut out = vec![0.0f32; full_len];
        let mut envelope = vec![0.0f32; full_len];
        let mut bins = vec![Complex32::new(0.0, 0.0); n_bins];
        let mut time = self.irfft.make_output_vec();
        let scale = 1.0 / self.n_fft as f32;

        for (ti, frame) in spec.iter().enumerate() {
            if frame.len() != n_bins {
                return Err(SpectralError::BinMismatch {
                    expected: n_bins,
                    actual: frame.len(),
                });
            }
            bins.copy_from_slice(frame);
            // A real signal has no imaginary DC or Nyquist component.
            bins[0].im = 0.0;
            bins[n_bins - 1].im = 0.0;

            self.irfft
                .process(&mut bins, &mut time)
                .map_err(|e| SpectralError::Fft(e.to_string()))?;

            let start = ti * self.hop_length;
            for (wi, &tv) in time.iter().enumerate() {
                out[start + wi] += tv * scale * self.window[wi];
                envelope[start + wi] += self.window_sq[wi];
            }
        }

        for (v, &env) in out.iter_mut().zip(envelope.iter()) {
            if env > 1e-11 {
                *v /= env;
            }
        }

        let pad = self.n_fft / 2;
        let mut trimmed: Vec<f32> = out.into_iter().skip(pad).take(length).collect();
        trimmed.resize(length, 0.0);
        Ok(trimmed)
    }
}

/// Griffin-Lim phase reconstruction settings
#[derive(Clone, Debug)]
pub struct GriffinLimConfig {
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_iter: usize,
    /// Exponent the magnitudes were raised to (1 for magnitude, 2 for power)
    pub power: f32,
    /// Fast Griffin-Lim momentum; 0 gives the classic algorithm
    pub momentum: f32,
    /// Seed for the initial phase estimate
    pub seed: u64,
}

impl Default for GriffinLimConfig {
    fn default() -> Self {
        Self {
            n_fft: 1024,
            hop_length: 256,
            n_iter: 60,
            power: 1.0,
            momentum: 0.99,
            seed: 0,
        }
    }
}

/// Iterative phase estimation for a magnitude spectrogram
#[derive(Debug)]
pub struct GriffinLim {
    plan: StftPlan,
    config: GriffinLimConfig,
}

impl GriffinLim {
    pub fn new(config: GriffinLimConfig) -> Result<Self, SpectralError> {
        let plan = StftPlan::new(config.n_fft, config.hop_length)?;
        Ok(Self { plan, config })
    }

    pub fn plan(&self) -> &StftPlan {
        &self.plan
    }

    /// Estimate a waveform whose STFT magnitude matches `magnitude`.
    ///
    /// The starting phase comes from a seeded generator, so the same input
    /// always yields the same samples.
    pub fn reconstruct(&self, magnitude: &[Vec<f32>]) -> Result<Vec<f32>, SpectralError> {
        self.reconstruct_cancellable(magnitude, &CancellationToken::new())
    }

    /// [`Self::reconstruct`], checking `cancel` before every iteration.
    pub fn reconstruct_cancellable(
        &self,
        magnitude: &[Vec<f32>],
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, SpectralError> {
        let n_bins = self.plan.bins();
        if let Some(bad) = magnitude.iter().find(|f| f.len() != n_bins) {
            return Err(SpectralError::BinMismatch {
                expected: n_bins,
                actual: bad.len(),
            });
        }
        let length = self.plan.signal_len(magnitude.len());
        if length == 0 {
            return Err(SpectralError::EmptySignal);
        }
        let pad = self.plan.n_fft() / 2;
        if length <= pad {
            return Err(SpectralError::TooShort { len: length, pad });
        }

        let magnitude: Vec<Vec<f32>> = if (self.config.power - 1.0).abs() > f32::EPSILON {
            let exponent = 1.0 / self.config.power;
            magnitude
                .iter()
                .map(|f| f.iter().map(|v| v.powf(exponent)).collect())
                .collect()
        } else {
            magnitude.to_vec()
        };

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut angles: Vec<Vec<Complex32>> = magnitude
            .iter()
            .map(|f| {
                f.iter()
                    .map(|_| Complex32::new(rng.random::<f32>(), rng.random::<f32>()))
                    .collect()
            })
            .collect();

        let blend = self.config.momentum / (1.0 + self.config.momentum);
        let mut previous: Option<Vec<Vec<Complex32>>> = None;

        for _ in 0..self.config.n_iter {
            if cancel.is_cancelled() {
                return Err(SpectralError::Cancelled);
            }
            let inverse = self.plan.istft(&apply_phase(&magnitude, &angles), length)?;
            let rebuilt = self.plan.stft(&inverse)?;

            for (ti, frame) in angles.iter_mut().enumerate() {
                for (fi, angle) in frame.iter_mut().enumerate() {
                    let mut z = rebuilt[ti][fi];
                    if let Some(prev) = &previous {
                        z -= prev[ti][fi] * blend;
                    }
                    *angle = z / (z.norm() + 1e-16);
                }
            }
            previous = Some(rebuilt);
        }

        self.plan.istft(&apply_phase(&magnitude, &angles), length)
    }
}

fn apply_phase(magnitude: &[Vec<f32>], angles: &[Vec<Complex32>]) -> Vec<Vec<Complex32>> {
    magnitude
        .iter()
        .zip(angles.iter())
        .map(|(m, a)| m.iter().zip(a.iter()).map(|(&m, &a)| a * m).collect())
        .collect()
}

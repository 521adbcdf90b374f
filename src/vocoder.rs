//! Mel-spectrogram vocoder
//!
//! Inverts the HTK mel filterbank with a regularised pseudo-inverse and
//! recovers phase with Griffin-Lim. There are no learned parameters and no
//! hidden randomness: the same mel sequence always gives the same waveform.
//! When inversion cannot produce a finite, non-empty signal the vocoder
//! returns a fixed test tone instead of an error.

use crate::mel::{MelSequence, MEL_CHANNELS};
use crate::spectral::{GriffinLim, GriffinLimConfig, SpectralError};
use crate::tone;
use crate::wav::Waveform;
use candle_core::{Device, Tensor};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

#[derive(Error, Debug)]
pub enum VocoderError {
    #[error("spectral error: {0}")]
    Spectral(SpectralError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("non-finite values in {0}")]
    NonFinite(&'static str),

    #[error("mel filterbank is singular")]
    SingularFilterbank,

    #[error("vocoding cancelled")]
    Cancelled,
}

impl From<SpectralError> for VocoderError {
    fn from(err: SpectralError) -> Self {
        match err {
            SpectralError::Cancelled => VocoderError::Cancelled,
            other => VocoderError::Spectral(other),
        }
    }
}

/// Vocoder settings. Defaults match a 22.05 kHz, 80-band, 0-8 kHz front end.
#[derive(Clone, Debug)]
pub struct VocoderConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_iter: usize,
    pub power: f32,
    pub momentum: f32,
    pub f_min: f64,
    pub f_max: f64,
    /// Upper clamp applied to log-mel values before exponentiation
    pub log_mel_max: f32,
    /// Floor applied to the recovered linear magnitudes
    pub magnitude_floor: f32,
    /// Tikhonov weight, relative to the largest Gram diagonal entry
    pub ridge: f64,
    /// Seed for the initial Griffin-Lim phase
    pub seed: u64,
    pub fallback_tone_secs: f32,
    pub fallback_tone_hz: f32,
    pub fallback_tone_amplitude: f32,
}

impl Default for VocoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            n_fft: 1024,
            hop_length: 256,
            n_iter: 60,
            power: 1.0,
            momentum: 0.99,
            f_min: 0.0,
            f_max: 8000.0,
            log_mel_max: 10.0,
            magnitude_floor: 1e-10,
            ridge: 1e-4,
            seed: 0,
            fallback_tone_secs: 2.0,
            fallback_tone_hz: 440.0,
            fallback_tone_amplitude: 0.3,
        }
    }
}

pub fn hz_to_mel(freq: f64) -> f64 {
    2595.0 * (1.0 + freq / 700.0).log10()
}

pub fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10.0_f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular HTK filterbank without area normalisation, `fb[mel][bin]`.
pub fn mel_filterbank(
    n_mels: usize,
    n_fft: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;
    let bin_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| nyquist * i as f64 / (n_freqs - 1) as f64)
        .collect();

    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);
    let points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (lower, centre, upper) = (points[m], points[m + 1], points[m + 2]);
            bin_freqs
                .iter()
                .map(|&f| {
                    let down = (f - lower) / (centre - lower);
                    let up = (upper - f) / (upper - centre);
                    down.min(up).max(0.0)
                })
                .collect()
        })
        .collect()
}

/// In-place Cholesky factorisation of a symmetric positive definite matrix.
/// Leaves the lower factor in `a`.
fn cholesky(a: &mut [Vec<f64>]) -> Result<(), VocoderError> {
    let n = a.len();
    for j in 0..n {
        let mut diag = a[j][j];
        for k in 0..j {
            diag -= a[j][k] * a[j][k];
        }
        if diag <= 0.0 || !diag.is_finite() {
            return Err(VocoderError::SingularFilterbank);
        }
        let diag = diag.sqrt();
        a[j][j] = diag;
        for i in j + 1..n {
            let mut v = a[i][j];
            for k in 0..j {
                v -= a[i][k] * a[j][k];
            }
            a[i][j] = v / diag;
        }
        for k in j + 1..n {
            a[j][k] = 0.0;
        }
    }
    Ok(())
}

/// Solve `L Lᵀ x = b` given the Cholesky factor `L`.
fn cholesky_solve(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = l.len();
    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut v = b[i];
        for k in 0..i {
            v -= l[i][k] * y[k];
        }
        y[i] = v / l[i][i];
    }
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut v = y[i];
        for k in i + 1..n {
            v -= l[k][i] * x[k];
        }
        x[i] = v / l[i][i];
    }
    x
}

/// `(n_mels, n_freqs)` matrix `B` such that `mel_energies · B` approximates
/// the linear spectrogram: `B = (A Aᵀ + λI)⁻¹ A` for the filterbank `A`.
fn inverse_basis(fb: &[Vec<f64>], ridge: f64) -> Result<Vec<Vec<f64>>, VocoderError> {
    let n_mels = fb.len();
    let mut gram = vec![vec![0.0f64; n_mels]; n_mels];
    for i in 0..n_mels {
        for j in 0..=i {
            let dot: f64 = fb[i].iter().zip(&fb[j]).map(|(a, b)| a * b).sum();
            gram[i][j] = dot;
            gram[j][i] = dot;
        }
    }
    let max_diag = (0..n_mels).map(|i| gram[i][i]).fold(0.0f64, f64::max);
    if max_diag <= 0.0 {
        return Err(VocoderError::SingularFilterbank);
    }
    let lambda = ridge * max_diag;
    for (i, row) in gram.iter_mut().enumerate() {
        row[i] += lambda;
    }
    cholesky(&mut gram)?;

    let n_freqs = fb.first().map(Vec::len).unwrap_or(0);
    let mut basis = vec![vec![0.0f64; n_freqs]; n_mels];
    for f in 0..n_freqs {
        let column: Vec<f64> = fb.iter().map(|row| row[f]).collect();
        let solved = cholesky_solve(&gram, &column);
        for (m, v) in solved.into_iter().enumerate() {
            basis[m][f] = v;
        }
    }
    Ok(basis)
}

/// Deterministic mel-to-waveform converter
#[derive(Debug)]
pub struct MelVocoder {
    config: VocoderConfig,
    basis: Tensor,
    griffin_lim: GriffinLim,
    device: Device,
}

impl MelVocoder {
    pub fn new(config: VocoderConfig) -> Result<Self, VocoderError> {
        let device = Device::Cpu;
        let fb = mel_filterbank(
            MEL_CHANNELS,
            config.n_fft,
            config.sample_rate,
            config.f_min,
            config.f_max,
        );
        let basis = inverse_basis(&fb, config.ridge)?;
        let n_freqs = config.n_fft / 2 + 1;
        let flat: Vec<f32> = basis.iter().flatten().map(|&v| v as f32).collect();
        let basis = Tensor::from_vec(flat, (MEL_CHANNELS, n_freqs), &device)?;

        let griffin_lim = GriffinLim::new(GriffinLimConfig {
            n_fft: config.n_fft,
            hop_length: config.hop_length,
            n_iter: config.n_iter,
            power: config.power,
            momentum: config.momentum,
            seed: config.seed,
        })?;

        debug!(
            n_fft = config.n_fft,
            hop = config.hop_length,
            n_iter = config.n_iter,
            "vocoder ready"
        );

        Ok(Self {
            config,
            basis,
            griffin_lim,
            device,
        })
    }

    pub fn config(&self) -> &VocoderConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Linear magnitude spectrogram `[frame][bin]` for a mel sequence
    pub fn linear_magnitude(&self, mel: &MelSequence) -> Result<Vec<Vec<f32>>, VocoderError> {
        if !mel.is_finite() {
            return Err(VocoderError::NonFinite("mel input"));
        }
        let energies = mel
            .to_tensor(&self.device)?
            .minimum(self.config.log_mel_max)?
            .exp()?;
        let spec = energies
            .matmul(&self.basis)?
            .maximum(self.config.magnitude_floor)?;
        Ok(spec.to_vec2()?)
    }

    /// Full inversion, surfacing any failure.
    pub fn try_mel_to_waveform(&self, mel: &MelSequence) -> Result<Waveform, VocoderError> {
        self.invert(mel, &CancellationToken::new())
    }

    fn invert(&self, mel: &MelSequence, cancel: &CancellationToken) -> Result<Waveform, VocoderError> {
        let magnitude = self.linear_magnitude(mel)?;
        if magnitude.iter().flatten().any(|v| !v.is_finite()) {
            return Err(VocoderError::NonFinite("linear spectrogram"));
        }
        let samples = self.griffin_lim.reconstruct_cancellable(&magnitude, cancel)?;
        if samples.iter().any(|v| !v.is_finite()) {
            return Err(VocoderError::NonFinite("waveform"));
        }
        Ok(Waveform::new(samples, self.config.sample_rate))
    }

    /// Convert a mel sequence to audio. Never fails: any inversion problem
    /// yields [`Self::fallback_tone`].
    #[instrument(skip(self, mel), fields(frames = mel.len()))]
    pub fn mel_to_waveform(&self, mel: &MelSequence) -> Waveform {
        match self.try_mel_to_waveform(mel) {
            Ok(waveform) => waveform,
            Err(e) => {
                warn!("mel inversion failed, using test tone: {}", e);
                self.fallback_tone()
            }
        }
    }

    /// Like [`Self::mel_to_waveform`], but gives up with
    /// [`VocoderError::Cancelled`] once `cancel` fires. No other error escapes.
    #[instrument(skip_all, fields(frames = mel.len()))]
    pub fn mel_to_waveform_cancellable(
        &self,
        mel: &MelSequence,
        cancel: &CancellationToken,
    ) -> Result<Waveform, VocoderError> {
        match self.invert(mel, cancel) {
            Ok(waveform) => Ok(waveform),
            Err(VocoderError::Cancelled) => Err(VocoderError::Cancelled),
            Err(e) => {
                warn!("mel inversion failed, using test tone: {}", e);
                Ok(self.fallback_tone())
            }
        }
    }

    pub fn fallback_tone(&self) -> Waveform {
        Waveform::new(
            tone::test_tone(
                self.config.sample_rate,
                self.config.fallback_tone_secs,
                self.config.fallback_tone_hz,
                self.config.fallback_tone_amplitude,
            ),
            self.config.sample_rate,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mel::MelFrame;

    fn quick_config() -> VocoderConfig {
        VocoderConfig {
            n_iter: 4,
            ..Default::default()
        }
    }

    fn ramp_mel(frames: usize) -> MelSequence {
        let frames: Vec<MelFrame> = (0..frames)
            .map(|t| {
                let mut frame = [0.0f32; MEL_CHANNELS];
                for (m, v) in frame.iter_mut().enumerate() {
                    *v = -4.0 + ((t + m) % 7) as f32 * 0.5;
                }
                frame
            })
            .collect();
        let stops = vec![0.0; frames.len()];
        MelSequence::new(frames, stops).unwrap()
    }

    #[test]
    fn test_mel_scale_round_trip() {
        for freq in [0.0, 100.0, 1000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(freq)) - freq).abs() < 1e-6);
        }
    }

    #[test]
    fn test_filterbank_shape_and_range() {
        let fb = mel_filterbank(MEL_CHANNELS, 1024, 22050, 0.0, 8000.0);
        assert_eq!(fb.len(), MEL_CHANNELS);
        assert!(fb.iter().all(|row| row.len() == 513));
        assert!(fb.iter().flatten().all(|&v| (0.0..=1.0).contains(&v)));
        // Bins above f_max carry no weight.
        let cutoff = (8000.0 / 22050.0 * 1024.0) as usize + 2;
        assert!(fb.iter().all(|row| row[cutoff..].iter().all(|&v| v == 0.0)));
    }

    #[test]
    fn test_pseudo_inverse_recovers_mel_energies() {
        let fb = mel_filterbank(MEL_CHANNELS, 1024, 22050, 0.0, 8000.0);
        let basis = inverse_basis(&fb, 1e-8).unwrap();
        // A · (Bᵀ e) should give back e for smooth mel energies.
        let energies: Vec<f64> = (0..MEL_CHANNELS).map(|m| 1.0 + (m as f64 * 0.1).sin()).collect();
        let spec: Vec<f64> = (0..513)
            .map(|f| (0..MEL_CHANNELS).map(|m| energies[m] * basis[m][f]).sum())
            .collect();
        for (m, row) in fb.iter().enumerate() {
            let back: f64 = row.iter().zip(&spec).map(|(a, s)| a * s).sum();
            assert!((back - energies[m]).abs() < 1e-2, "band {m}: {back} vs {}", energies[m]);
        }
    }

    #[test]
    fn test_waveform_length_and_rate() {
        let vocoder = MelVocoder::new(quick_config()).unwrap();
        let waveform = vocoder.try_mel_to_waveform(&ramp_mel(12)).unwrap();
        assert_eq!(waveform.sample_rate, 22050);
        assert_eq!(waveform.len(), 11 * 256);
    }

    #[test]
    fn test_deterministic() {
        let vocoder = MelVocoder::new(quick_config()).unwrap();
        let mel = ramp_mel(10);
        assert_eq!(vocoder.mel_to_waveform(&mel), vocoder.mel_to_waveform(&mel));

        let other = MelVocoder::new(quick_config()).unwrap();
        assert_eq!(vocoder.mel_to_waveform(&mel), other.mel_to_waveform(&mel));
    }

    #[test]
    fn test_extreme_values_are_clamped() {
        let vocoder = MelVocoder::new(quick_config()).unwrap();
        let frames = vec![[1e6f32; MEL_CHANNELS]; 6];
        let mel = MelSequence::new(frames, vec![0.0; 6]).unwrap();
        let magnitude = vocoder.linear_magnitude(&mel).unwrap();
        assert!(magnitude.iter().flatten().all(|v| v.is_finite() && *v >= 1e-10));
    }

    #[test]
    fn test_failure_falls_back_to_tone() {
        let vocoder = MelVocoder::new(quick_config()).unwrap();

        let mut frame = [0.0f32; MEL_CHANNELS];
        frame[0] = f32::NAN;
        let nan_mel = MelSequence::new(vec![frame; 4], vec![0.0; 4]).unwrap();
        assert_eq!(vocoder.mel_to_waveform(&nan_mel), vocoder.fallback_tone());

        // One frame has no hop to span, so inversion yields no samples.
        let single = MelSequence::new(vec![[0.0; MEL_CHANNELS]], vec![0.0]).unwrap();
        let waveform = vocoder.mel_to_waveform(&single);
        assert_eq!(waveform.len(), 44100);
        assert!((waveform.peak() - 0.3).abs() < 1e-3);
    }

    #[test]
    fn test_short_mels_fall_back_to_tone() {
        let vocoder = MelVocoder::new(quick_config()).unwrap();
        for frames in [2, 3] {
            assert!(vocoder.try_mel_to_waveform(&ramp_mel(frames)).is_err());
            assert_eq!(vocoder.mel_to_waveform(&ramp_mel(frames)), vocoder.fallback_tone());
        }
        assert_eq!(vocoder.mel_to_waveform(&ramp_mel(4)).len(), 3 * 256);
    }

    #[test]
    fn test_cancellation_is_not_replaced_by_tone() {
        let vocoder = MelVocoder::new(quick_config()).unwrap();
        let cancel = CancellationToken::new();
        let mel = ramp_mel(10);
        assert_eq!(
            vocoder.mel_to_waveform_cancellable(&mel, &cancel).unwrap(),
            vocoder.mel_to_waveform(&mel)
        );

        cancel.cancel();
        assert!(matches!(
            vocoder.mel_to_waveform_cancellable(&mel, &cancel),
            Err(VocoderError::Cancelled)
        ));
        // Failures other than cancellation still become the tone.
        let single = MelSequence::new(vec![[0.0; MEL_CHANNELS]], vec![0.0]).unwrap();
        assert_eq!(
            vocoder.mel_to_waveform_cancellable(&single, &CancellationToken::new()).unwrap(),
            vocoder.fallback_tone()
        );
    }
}

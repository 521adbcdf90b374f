//! Mel-spectrogram values passed from the acoustic model to the vocoder
//!
//! The frame width is part of the type: a [`MelSequence`] can only hold frames
//! of [`MEL_CHANNELS`] coefficients and always holds at least one of them.

use candle_core::{Device, Tensor};
use thiserror::Error;

/// Coefficients per mel frame.
pub const MEL_CHANNELS: usize = 80;

/// One log-magnitude mel frame.
pub type MelFrame = [f32; MEL_CHANNELS];

/// Reasons a mel sequence is rejected at construction
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MelShapeError {
    #[error("mel sequence must contain at least one frame")]
    Empty,

    #[error("{frames} frames but {stops} stop logits")]
    LengthMismatch { frames: usize, stops: usize },

    #[error("flat mel buffer of {len} values is not a multiple of 80")]
    Ragged { len: usize },

    #[error("expected a (frames, 80) tensor, got {0:?}")]
    BadTensor(Vec<usize>),
}

/// Non-empty sequence of mel frames with a per-frame stop logit
#[derive(Clone, Debug, PartialEq)]
pub struct MelSequence {
    frames: Vec<MelFrame>,
    stop_logits: Vec<f32>,
}

impl MelSequence {
    pub fn new(frames: Vec<MelFrame>, stop_logits: Vec<f32>) -> Result<Self, MelShapeError> {
        if frames.is_empty() {
            return Err(MelShapeError::Empty);
        }
        if frames.len() != stop_logits.len() {
            return Err(MelShapeError::LengthMismatch {
                frames: frames.len(),
                stops: stop_logits.len(),
            });
        }
        Ok(Self {
            frames,
            stop_logits,
        })
    }

    /// Build from frame-major flat values; stop logits default to zero.
    pub fn from_flat(values: &[f32]) -> Result<Self, MelShapeError> {
        if values.len() % MEL_CHANNELS != 0 {
            return Err(MelShapeError::Ragged { len: values.len() });
        }
        let frames: Vec<MelFrame> = values
            .chunks_exact(MEL_CHANNELS)
            .map(|chunk| {
                let mut frame = [0.0f32; MEL_CHANNELS];
                frame.copy_from_slice(chunk);
                frame
            })
            .collect();
        let stops = vec![0.0; frames.len()];
        Self::new(frames, stops)
    }

    /// Build from a `(frames, 80)` tensor.
    pub fn from_tensor(mel: &Tensor, stop_logits: Vec<f32>) -> Result<Self, MelShapeError> {
        let dims = mel.dims().to_vec();
        if dims.len() != 2 || dims[1] != MEL_CHANNELS {
            return Err(MelShapeError::BadTensor(dims));
        }
        let rows: Vec<Vec<f32>> = mel
            .to_vec2()
            .map_err(|_| MelShapeError::BadTensor(dims.clone()))?;
        let frames = rows
            .into_iter()
            .map(|row| {
                let mut frame = [0.0f32; MEL_CHANNELS];
                frame.copy_from_slice(&row);
                frame
            })
            .collect();
        Self::new(frames, stop_logits)
    }

    pub fn frames(&self) -> &[MelFrame] {
        &self.frames
    }

    pub fn stop_logits(&self) -> &[f32] {
        &self.stop_logits
    }

    /// Number of frames, always at least one
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// `(frames, 80)` tensor on `device`
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let flat: Vec<f32> = self.frames.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (self.frames.len(), MEL_CHANNELS), device)
    }

    /// Whether every coefficient and stop logit is finite
    pub fn is_finite(&self) -> bool {
        self.frames.iter().flatten().all(|v| v.is_finite())
            && self.stop_logits.iter().all(|v| v.is_finite())
    }
}

/// Attention weights over token positions, one row per generated frame
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttentionTrace {
    tokens: usize,
    rows: Vec<Vec<f32>>,
}

impl AttentionTrace {
    pub fn new(tokens: usize) -> Self {
        Self {
            tokens,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<f32>) {
        debug_assert_eq!(row.len(), self.tokens);
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    pub fn frames(&self) -> usize {
        self.rows.len()
    }

    /// Token position with the highest weight for each frame
    pub fn alignment(&self) -> Vec<usize> {
        self.rows
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &w)| {
                        if w > best.1 {
                            (i, w)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_rejects_empty() {
        assert_eq!(MelSequence::new(vec![], vec![]), Err(MelShapeError::Empty));
        assert_eq!(MelSequence::from_flat(&[]), Err(MelShapeError::Empty));
    }

    #[test]
    fn test_rejects_mismatched_stops() {
        let err = MelSequence::new(vec![[0.0; MEL_CHANNELS]; 3], vec![0.0; 2]).unwrap_err();
        assert_eq!(err, MelShapeError::LengthMismatch { frames: 3, stops: 2 });
    }

    #[test]
    fn test_from_flat_checks_width() {
        assert!(matches!(
            MelSequence::from_flat(&[0.0; 81]),
            Err(MelShapeError::Ragged { len: 81 })
        ));
        let mel = MelSequence::from_flat(&[1.0; MEL_CHANNELS * 4]).unwrap();
        assert_eq!(mel.len(), 4);
        assert_eq!(mel.stop_logits(), &[0.0; 4]);
    }

    #[test]
    fn test_tensor_round_trip_shape() {
        let device = Device::Cpu;
        let t = Tensor::ones((5, MEL_CHANNELS), DType::F32, &device).unwrap();
        let mel = MelSequence::from_tensor(&t, vec![0.0; 5]).unwrap();
        assert_eq!(mel.to_tensor(&device).unwrap().dims(), &[5, MEL_CHANNELS]);

        let wrong = Tensor::ones((5, 64), DType::F32, &device).unwrap();
        assert!(matches!(
            MelSequence::from_tensor(&wrong, vec![0.0; 5]),
            Err(MelShapeError::BadTensor(_))
        ));
    }

    #[test]
    fn test_attention_alignment() {
        let mut trace = AttentionTrace::new(3);
        trace.push(vec![0.7, 0.2, 0.1]);
        trace.push(vec![0.1, 0.3, 0.6]);
        assert_eq!(trace.frames(), 2);
        assert_eq!(trace.alignment(), vec![0, 2]);
    }

    #[test]
    fn test_is_finite() {
        let mut frame = [0.0; MEL_CHANNELS];
        frame[3] = f32::NAN;
        let mel = MelSequence::new(vec![frame], vec![0.0]).unwrap();
        assert!(!mel.is_finite());
    }
}

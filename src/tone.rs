//! Deterministic waveforms that need no model
//!
//! Used by the bottom of the fallback chain and by the vocoder when phase
//! reconstruction cannot produce a usable signal.

use std::f32::consts::PI;

/// Lower bound on character-tone duration, in seconds.
pub const MIN_TONE_SECS: f32 = 1.0;
/// Upper bound on character-tone duration, in seconds.
pub const MAX_TONE_SECS: f32 = 5.0;
/// Seconds of tone per input character.
pub const SECS_PER_CHAR: f32 = 0.1;
/// Characters that get a tone of their own.
pub const MAX_TONED_CHARS: usize = 20;

const BASE_FREQ_HZ: f32 = 200.0;
const CHAR_AMPLITUDE: f32 = 0.2;

/// `n` evenly spaced points over `[0, end]`, both ends included
fn linspace(end: f32, n: usize) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![0.0],
        _ => {
            let step = end / (n - 1) as f32;
            (0..n).map(|i| i as f32 * step).collect()
        }
    }
}

/// Duration of the character-tone rendering for `text`
pub fn tone_duration(text: &str) -> f32 {
    (text.chars().count() as f32 * SECS_PER_CHAR).clamp(MIN_TONE_SECS, MAX_TONE_SECS)
}

/// Frequency assigned to a character
pub fn char_frequency(c: char) -> f32 {
    BASE_FREQ_HZ + (c as u32 % 100) as f32 * 2.0
}

/// Render text as a sequence of short tones.
///
/// Every character owns an equal slice of the duration; the first
/// [`MAX_TONED_CHARS`] slices carry a sine at [`char_frequency`], the rest stay
/// silent. A decaying envelope `exp(-2t / duration)` is applied on top.
pub fn character_tones(text: &str, sample_rate: u32) -> Vec<f32> {
    let duration = tone_duration(text);
    let sr = sample_rate as f32;
    let t = linspace(duration, (sr * duration) as usize);
    let mut audio = vec![0.0f32; t.len()];

    let total_chars = text.chars().count();
    for (i, c) in text.chars().take(MAX_TONED_CHARS).enumerate() {
        let freq = char_frequency(c);
        let start = ((i as f32 * duration / total_chars as f32) * sr) as usize;
        let end = (((i + 1) as f32 * duration / total_chars as f32) * sr) as usize;
        let end = end.min(t.len());
        if start >= end {
            continue;
        }
        for (sample, &ti) in audio[start..end].iter_mut().zip(&t[start..end]) {
            *sample += CHAR_AMPLITUDE * (2.0 * PI * freq * ti).sin();
        }
    }

    for (sample, &ti) in audio.iter_mut().zip(t.iter()) {
        *sample *= (-ti / duration * 2.0).exp();
    }
    audio
}

/// Plain sine used when mel inversion fails
pub fn test_tone(sample_rate: u32, duration_secs: f32, frequency: f32, amplitude: f32) -> Vec<f32> {
    let t = linspace(duration_secs, (sample_rate as f32 * duration_secs) as usize);
    t.iter()
        .map(|&ti| amplitude * (2.0 * PI * frequency * ti).sin())
        .collect()
}

pub fn silence(sample_rate: u32, duration_secs: f32) -> Vec<f32> {
    vec![0.0; (sample_rate as f32 * duration_secs) as usize]
}

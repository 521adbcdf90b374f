//! Acoustic model: token sequence and speaker to mel frames.
//!
//! A bidirectional LSTM encodes the speaker-conditioned token embeddings.
//! Decoding is autoregressive: each step attends over the encoder states with
//! a query derived from the previous mel frame, advances an LSTM decoder cell
//! on `[context, previous frame]`, and projects the hidden state to the next
//! mel frame and a stop logit.
//!
//! Parameter names follow the PyTorch module layout (`text_encoder.weight_ih_l0`,
//! `attention.in_proj_weight`, ...) so exported state dicts load unchanged.

use crate::config::DecodeConfig;
use crate::mel::{AttentionTrace, MelFrame, MelSequence, MEL_CHANNELS};
use crate::speakers::{SpeakerId, SPEAKER_SLOTS};
use crate::tts::TtsError;
use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::rnn::{Direction, LSTMConfig, LSTMState, LSTM, RNN};
use candle_nn::init::Init;
use candle_nn::{Embedding, Linear, VarBuilder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Vocabulary size of the GPT-2 family tokenizer the checkpoints were trained with.
pub const DEFAULT_VOCAB_SIZE: usize = 50257;

/// Acoustic model dimensions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcousticConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub num_heads: usize,
    pub speaker_slots: usize,
}

impl Default for AcousticConfig {
    fn default() -> Self {
        Self {
            vocab_size: DEFAULT_VOCAB_SIZE,
            hidden_dim: 256,
            num_heads: 8,
            speaker_slots: SPEAKER_SLOTS as usize,
        }
    }
}

impl AcousticConfig {
    /// Width of the bidirectional encoder output and of the attention space
    pub fn encoder_dim(&self) -> usize {
        self.hidden_dim * 2
    }

    /// Input width of the decoder cell
    pub fn decoder_input_dim(&self) -> usize {
        self.encoder_dim() + MEL_CHANNELS
    }
}

fn lstm_shapes(prefix: &str, suffix: &str, input: usize, hidden: usize) -> Vec<(String, Vec<usize>)> {
    vec![
        (format!("{prefix}.weight_ih_l0{suffix}"), vec![4 * hidden, input]),
        (format!("{prefix}.weight_hh_l0{suffix}"), vec![4 * hidden, hidden]),
        (format!("{prefix}.bias_ih_l0{suffix}"), vec![4 * hidden]),
        (format!("{prefix}.bias_hh_l0{suffix}"), vec![4 * hidden]),
    ]
}

/// Every parameter the model reads, with its shape
pub fn parameter_shapes(config: &AcousticConfig) -> Vec<(String, Vec<usize>)> {
    let h = config.hidden_dim;
    let e = config.encoder_dim();
    let mut shapes = vec![
        ("text_embedding.weight".to_string(), vec![config.vocab_size, h]),
        ("speaker_embedding.weight".to_string(), vec![config.speaker_slots, h]),
    ];
    shapes.extend(lstm_shapes("text_encoder", "", h, h));
    shapes.extend(lstm_shapes("text_encoder", "_reverse", h, h));
    shapes.extend([
        ("attention_query.weight".to_string(), vec![e, MEL_CHANNELS]),
        ("attention_query.bias".to_string(), vec![e]),
        ("attention.in_proj_weight".to_string(), vec![3 * e, e]),
        ("attention.in_proj_bias".to_string(), vec![3 * e]),
        ("attention.out_proj.weight".to_string(), vec![e, e]),
        ("attention.out_proj.bias".to_string(), vec![e]),
    ]);
    shapes.extend(lstm_shapes("decoder_lstm", "", config.decoder_input_dim(), h));
    shapes.extend([
        ("mel_projection.weight".to_string(), vec![MEL_CHANNELS, h]),
        ("mel_projection.bias".to_string(), vec![MEL_CHANNELS]),
        ("stop_projection.weight".to_string(), vec![1, h]),
        ("stop_projection.bias".to_string(), vec![1]),
    ]);
    shapes
}

/// Multi-head attention with packed input projections
#[derive(Debug, Clone)]
struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

/// Keys and values for one encoded utterance, laid out `(heads, tokens, head_dim)`
struct EncodedMemory {
    keys_t: Tensor,
    values: Tensor,
    tokens: usize,
}

impl MultiHeadAttention {
    fn new(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            return Err(candle_core::Error::Msg(format!(
                "embed dim {embed_dim} is not divisible by {num_heads} heads"
            )));
        }
        let weight = vb.get_with_hints(
            (3 * embed_dim, embed_dim),
            "in_proj_weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = vb.get_with_hints(3 * embed_dim, "in_proj_bias", Init::Const(0.))?;
        let part = |i: usize| -> Result<Linear> {
            Ok(Linear::new(
                weight.narrow(0, i * embed_dim, embed_dim)?,
                Some(bias.narrow(0, i * embed_dim, embed_dim)?),
            ))
        };
        Ok(Self {
            q_proj: part(0)?,
            k_proj: part(1)?,
            v_proj: part(2)?,
            out_proj: candle_nn::linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim: embed_dim / num_heads,
        })
    }

    /// `(tokens, embed)` -> `(heads, tokens, head_dim)`
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let tokens = x.dim(0)?;
        x.reshape((tokens, self.num_heads, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()
    }

    fn memory(&self, encoded: &Tensor) -> Result<EncodedMemory> {
        let tokens = encoded.dim(0)?;
        let keys = self.split_heads(&self.k_proj.forward(encoded)?)?;
        let values = self.split_heads(&self.v_proj.forward(encoded)?)?;
        Ok(EncodedMemory {
            keys_t: keys.transpose(1, 2)?.contiguous()?,
            values,
            tokens,
        })
    }

    /// Attend with a `(1, embed)` query. Returns the `(1, embed)` context and
    /// the head-averaged weights over tokens.
    fn attend(&self, query: &Tensor, memory: &EncodedMemory) -> Result<(Tensor, Vec<f32>)> {
        let q = self.split_heads(&self.q_proj.forward(query)?)?;
        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&memory.keys_t)? / scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = weights
            .matmul(&memory.values)?
            .transpose(0, 1)?
            .reshape((1, self.num_heads * self.head_dim))?;
        let context = self.out_proj.forward(&context)?;
        let averaged = weights.mean(0)?.reshape(memory.tokens)?.to_vec1::<f32>()?;
        Ok((context, averaged))
    }
}

/// Output of one decoding run
#[derive(Clone, Debug)]
pub struct Generation {
    pub mel: MelSequence,
    pub attention: AttentionTrace,
    /// Whether the stop head ended decoding before the frame budget ran out
    pub stopped: bool,
    /// Whether the single noise frame was substituted for an empty result
    pub safety_frame: bool,
}

/// Autoregressive attention decoder producing mel frames
#[derive(Debug, Clone)]
pub struct AcousticModel {
    config: AcousticConfig,
    text_embedding: Embedding,
    speaker_embedding: Embedding,
    encoder_forward: LSTM,
    encoder_backward: LSTM,
    attention_query: Linear,
    attention: MultiHeadAttention,
    decoder_lstm: LSTM,
    mel_projection: Linear,
    stop_projection: Linear,
    device: Device,
}

impl AcousticModel {
    pub fn new(config: AcousticConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_dim;
        let e = config.encoder_dim();
        let device = vb.device().clone();

        let text_embedding = candle_nn::embedding(config.vocab_size, h, vb.pp("text_embedding"))?;
        let speaker_embedding =
            candle_nn::embedding(config.speaker_slots, h, vb.pp("speaker_embedding"))?;

        let encoder_forward = candle_nn::rnn::lstm(h, h, LSTMConfig::default(), vb.pp("text_encoder"))?;
        let encoder_backward = candle_nn::rnn::lstm(
            h,
            h,
            LSTMConfig {
                direction: Direction::Backward,
                ..Default::default()
            },
            vb.pp("text_encoder"),
        )?;

        let attention_query = candle_nn::linear(MEL_CHANNELS, e, vb.pp("attention_query"))?;
        let attention = MultiHeadAttention::new(e, config.num_heads, vb.pp("attention"))?;

        let decoder_lstm = candle_nn::rnn::lstm(
            config.decoder_input_dim(),
            h,
            LSTMConfig::default(),
            vb.pp("decoder_lstm"),
        )?;
        let mel_projection = candle_nn::linear(h, MEL_CHANNELS, vb.pp("mel_projection"))?;
        let stop_projection = candle_nn::linear(h, 1, vb.pp("stop_projection"))?;

        Ok(Self {
            config,
            text_embedding,
            speaker_embedding,
            encoder_forward,
            encoder_backward,
            attention_query,
            attention,
            decoder_lstm,
            mel_projection,
            stop_projection,
            device,
        })
    }

    pub fn config(&self) -> &AcousticConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Contextual encoder states, `(tokens, 2 * hidden)`
    fn encode(&self, tokens: &[u32], speaker: SpeakerId) -> Result<Tensor> {
        let len = tokens.len();
        let ids = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let speaker_ids = Tensor::new(&[speaker.index()], &self.device)?;

        let speaker_emb = self.speaker_embedding.forward(&speaker_ids)?.unsqueeze(1)?;
        let embedded = self.text_embedding.forward(&ids)?.broadcast_add(&speaker_emb)?;

        let forward_states = self.encoder_forward.seq(&embedded)?;
        let forward = self.encoder_forward.states_to_tensor(&forward_states)?;

        let reversed: Vec<u32> = (0..len as u32).rev().collect();
        let reversed = Tensor::new(reversed.as_slice(), &self.device)?;
        let backward_states = self
            .encoder_backward
            .seq(&embedded.index_select(&reversed, 1)?)?;
        let backward = self
            .encoder_backward
            .states_to_tensor(&backward_states)?
            .index_select(&reversed, 1)?;

        Tensor::cat(&[&forward, &backward], D::Minus1)?.squeeze(0)
    }

    fn decode_step(
        &self,
        previous: &Tensor,
        memory: &EncodedMemory,
        state: &LSTMState,
    ) -> Result<(LSTMState, Tensor, f32, Vec<f32>)> {
        let query = self.attention_query.forward(previous)?;
        let (context, weights) = self.attention.attend(&query, memory)?;
        let input = Tensor::cat(&[&context, previous], 1)?;
        let state = self.decoder_lstm.step(&input, state)?;
        let frame = self.mel_projection.forward(state.h())?;
        let stop = self.stop_projection.forward(state.h())?.i((0, 0))?.to_scalar::<f32>()?;
        Ok((state, frame, stop, weights))
    }

    fn safety_frame(seed: u64) -> MelFrame {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut frame = [0.0f32; MEL_CHANNELS];
        for v in frame.iter_mut() {
            *v = rng.sample(StandardNormal);
        }
        frame
    }

    /// Generate mel frames for `tokens` spoken by `speaker`.
    ///
    /// Decoding runs for at most [`DecodeConfig::max_frames`] steps and stops
    /// after the first frame whose stop probability exceeds the threshold. The
    /// cancellation token is checked before every step. An empty result is
    /// replaced by one seeded noise frame, so the returned sequence is never empty.
    #[instrument(skip_all, fields(tokens = tokens.len(), speaker = %speaker))]
    pub fn generate(
        &self,
        tokens: &[u32],
        speaker: SpeakerId,
        decode: &DecodeConfig,
        cancel: &CancellationToken,
    ) -> std::result::Result<Generation, TtsError> {
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= self.config.vocab_size) {
            return Err(TtsError::Model(format!(
                "token id {bad} is outside the vocabulary of {}",
                self.config.vocab_size
            )));
        }
        if speaker.index() as usize >= self.config.speaker_slots {
            return Err(TtsError::Model(format!(
                "speaker {speaker} is outside the embedding table"
            )));
        }

        let max_frames = decode.max_frames(tokens.len());
        let mut trace = AttentionTrace::new(tokens.len());
        let mut frames: Vec<MelFrame> = Vec::with_capacity(max_frames);
        let mut stops: Vec<f32> = Vec::with_capacity(max_frames);
        let mut stopped = false;

        if max_frames > 0 {
            let encoded = self.encode(tokens, speaker)?;
            let memory = self.attention.memory(&encoded)?;
            let mut state = self.decoder_lstm.zero_state(1)?;
            let mut previous = Tensor::zeros((1, MEL_CHANNELS), DType::F32, &self.device)?;

            for _ in 0..max_frames {
                if cancel.is_cancelled() {
                    return Err(TtsError::Cancelled);
                }
                let (next_state, frame, stop, weights) =
                    self.decode_step(&previous, &memory, &state)?;

                let values = frame.squeeze(0)?.to_vec1::<f32>()?;
                let mut mel_frame = [0.0f32; MEL_CHANNELS];
                mel_frame.copy_from_slice(&values);
                frames.push(mel_frame);
                stops.push(stop);
                trace.push(weights);

                state = next_state;
                previous = frame;

                if sigmoid(stop) > decode.stop_threshold {
                    stopped = true;
                    break;
                }
            }
        }

        let safety_frame = frames.is_empty();
        if safety_frame {
            debug!("decoder produced no frames, emitting safety frame");
            frames.push(Self::safety_frame(decode.safety_seed));
            stops.push(0.0);
        }

        debug!(frames = frames.len(), stopped, "decoding finished");
        let mel = MelSequence::new(frames, stops).map_err(|e| TtsError::Model(e.to_string()))?;
        Ok(Generation {
            mel,
            attention: trace,
            stopped,
            safety_frame,
        })
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn small_config() -> AcousticConfig {
        AcousticConfig {
            vocab_size: 64,
            hidden_dim: 16,
            num_heads: 4,
            speaker_slots: 100,
        }
    }

    fn varmap_model(config: &AcousticConfig) -> (VarMap, AcousticModel) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = AcousticModel::new(config.clone(), vb).unwrap();
        (varmap, model)
    }

    #[test]
    fn test_parameter_shapes_match_varmap() {
        let config = small_config();
        let (varmap, _model) = varmap_model(&config);
        let vars = varmap.data().lock().unwrap();
        let shapes = parameter_shapes(&config);
        assert_eq!(vars.len(), shapes.len());
        for (name, shape) in shapes {
            let var = vars.get(&name).unwrap_or_else(|| panic!("missing {name}"));
            assert_eq!(var.dims(), shape.as_slice(), "shape of {name}");
        }
    }

    #[test]
    fn test_encoder_output_shape() {
        let config = small_config();
        let (_varmap, model) = varmap_model(&config);
        let encoded = model.encode(&[1, 2, 3, 4, 5], SpeakerId::DEFAULT).unwrap();
        assert_eq!(encoded.dims(), &[5, 32]);
    }

    #[test]
    fn test_generate_is_bounded_and_traced() {
        let config = small_config();
        let (_varmap, model) = varmap_model(&config);
        let decode = DecodeConfig {
            stop_threshold: 1.0,
            ..Default::default()
        };
        let out = model
            .generate(&[3, 7, 9], SpeakerId::DEFAULT, &decode, &CancellationToken::new())
            .unwrap();
        assert_eq!(out.mel.len(), 30);
        assert!(!out.stopped);
        assert!(!out.safety_frame);
        assert_eq!(out.attention.frames(), 30);
        for row in out.attention.rows() {
            assert_eq!(row.len(), 3);
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_empty_tokens_yield_safety_frame() {
        let config = small_config();
        let (_varmap, model) = varmap_model(&config);
        let decode = DecodeConfig::default();
        let a = model
            .generate(&[], SpeakerId::DEFAULT, &decode, &CancellationToken::new())
            .unwrap();
        let b = model
            .generate(&[], SpeakerId::DEFAULT, &decode, &CancellationToken::new())
            .unwrap();
        assert!(a.safety_frame);
        assert_eq!(a.mel.len(), 1);
        assert_eq!(a.mel.stop_logits(), &[0.0]);
        assert_eq!(a.mel, b.mel);
        assert!(a.mel.frames()[0].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_cancelled_before_first_step() {
        let config = small_config();
        let (_varmap, model) = varmap_model(&config);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = model
            .generate(&[1, 2], SpeakerId::DEFAULT, &DecodeConfig::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, TtsError::Cancelled));
    }

    #[test]
    fn test_out_of_vocab_token_is_rejected() {
        let config = small_config();
        let (_varmap, model) = varmap_model(&config);
        let err = model
            .generate(&[64], SpeakerId::DEFAULT, &DecodeConfig::default(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, TtsError::Model(_)));
    }

    #[test]
    fn test_config_json_defaults() {
        let config: AcousticConfig = serde_json::from_str(r#"{"vocab_size": 1000}"#).unwrap();
        assert_eq!(config.vocab_size, 1000);
        assert_eq!(config.hidden_dim, 256);
        assert_eq!(config.encoder_dim(), 512);
        assert_eq!(config.decoder_input_dim(), 592);
    }
}

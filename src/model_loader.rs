//! Checkpoint loading for the acoustic model
//!
//! A checkpoint holds every parameter under its PyTorch name, either as a
//! `.safetensors` file or as a torch `.pth`/`.pt` archive whose state dict sits
//! under `model_state_dict` (a bare state dict is accepted too). The
//! vocabulary size is taken from the `vocab_size` entry of the safetensors
//! metadata when present, otherwise from the row count of
//! `text_embedding.weight`. Other dimensions come from an optional
//! `config.json` next to the checkpoint.

use crate::model::{AcousticConfig, AcousticModel, DEFAULT_VOCAB_SIZE};
use candle_core::pickle::PthTensors;
use candle_core::{DType, Device, Error as CandleError, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Metadata key carrying the vocabulary size
pub const VOCAB_SIZE_KEY: &str = "vocab_size";

/// Key of the parameter map inside a torch training checkpoint
pub const STATE_DICT_KEY: &str = "model_state_dict";

const EMBEDDING_KEY: &str = "text_embedding.weight";
const SIDECAR_CONFIG: &str = "config.json";
const MAX_HEADER_BYTES: u64 = 100 * 1024 * 1024;

/// Errors that can occur during checkpoint loading
#[derive(Error, Debug)]
pub enum ModelLoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] CandleError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid model format: {0}")]
    InvalidFormat(String),

    #[error("Model file not found: {0}")]
    NotFound(String),
}

impl From<serde_json::Error> for ModelLoaderError {
    fn from(e: serde_json::Error) -> Self {
        ModelLoaderError::Serialization(e.to_string())
    }
}

impl From<safetensors::SafeTensorError> for ModelLoaderError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        ModelLoaderError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ModelLoaderError>;

/// Summary of a loaded checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    pub config: AcousticConfig,
    pub tensors: usize,
    pub parameters: usize,
    /// Where the vocabulary size came from
    pub vocab_source: VocabSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabSource {
    Metadata,
    EmbeddingRows,
    Default,
}

/// On-disk checkpoint format, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    SafeTensors,
    PyTorch,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("safetensors") => Ok(CheckpointFormat::SafeTensors),
            Some("pth") | Some("pt") => Ok(CheckpointFormat::PyTorch),
            _ => Err(ModelLoaderError::InvalidFormat(format!(
                "expected a .safetensors, .pth or .pt checkpoint: {:?}",
                path
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointFormat::SafeTensors => "SafeTensors",
            CheckpointFormat::PyTorch => "PyTorch",
        }
    }
}

/// Read the `__metadata__` map from a safetensors header without touching the
/// tensor data.
pub fn read_metadata(path: &Path) -> Result<HashMap<String, String>> {
    let mut file = File::open(path)?;
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len == 0 || header_len > MAX_HEADER_BYTES {
        return Err(ModelLoaderError::InvalidFormat(format!(
            "implausible safetensors header length {header_len} in {}",
            path.display()
        )));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    let header: HashMap<String, serde_json::Value> = serde_json::from_slice(&header)?;

    let metadata = header
        .get("__metadata__")
        .and_then(|m| m.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    Ok(metadata)
}

/// Model dimensions from the sidecar `config.json`, or the defaults.
pub fn sidecar_config(checkpoint: &Path) -> Result<AcousticConfig> {
    let path = checkpoint
        .parent()
        .map(|dir| dir.join(SIDECAR_CONFIG))
        .unwrap_or_else(|| PathBuf::from(SIDECAR_CONFIG));
    if !path.exists() {
        return Ok(AcousticConfig::default());
    }
    debug!("Reading model config from {:?}", path);
    let text = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&text)?)
}

fn resolve_vocab_size(
    metadata: &HashMap<String, String>,
    tensors: &HashMap<String, Tensor>,
) -> (usize, VocabSource) {
    if let Some(v) = metadata.get(VOCAB_SIZE_KEY) {
        match v.trim().parse::<usize>() {
            Ok(n) if n > 0 => return (n, VocabSource::Metadata),
            _ => warn!("Ignoring unparseable vocab_size metadata {:?}", v),
        }
    }
    if let Some(rows) = tensors.get(EMBEDDING_KEY).and_then(|t| t.dims().first().copied()) {
        return (rows, VocabSource::EmbeddingRows);
    }
    (DEFAULT_VOCAB_SIZE, VocabSource::Default)
}

/// Parameters of a torch archive, as `f32` tensors on `device`.
///
/// Training checkpoints nest the parameters under [`STATE_DICT_KEY`]; files
/// saved straight from `state_dict()` have them at the top level.
pub fn read_pytorch_tensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let pth = match PthTensors::new(path, Some(STATE_DICT_KEY)) {
        Ok(pth) if !pth.tensor_infos().is_empty() => pth,
        _ => {
            debug!("No {} entry in {:?}, reading a bare state dict", STATE_DICT_KEY, path);
            PthTensors::new(path, None)?
        }
    };

    let mut tensors = HashMap::with_capacity(pth.tensor_infos().len());
    for name in pth.tensor_infos().keys() {
        if let Some(tensor) = pth.get(name)? {
            tensors.insert(name.clone(), tensor.to_dtype(DType::F32)?.to_device(device)?);
        }
    }
    if tensors.is_empty() {
        return Err(ModelLoaderError::InvalidFormat(format!(
            "no tensors found in {:?}",
            path
        )));
    }
    Ok(tensors)
}

/// Load an acoustic model checkpoint onto `device`.
pub fn load_acoustic_model(path: &Path, device: &Device) -> Result<(AcousticModel, CheckpointInfo)> {
    if !path.exists() {
        return Err(ModelLoaderError::NotFound(path.display().to_string()));
    }
    let format = CheckpointFormat::from_path(path)?;

    info!("Loading {} acoustic model from {:?}", format.as_str(), path);
    let (metadata, tensors) = match format {
        CheckpointFormat::SafeTensors => (
            read_metadata(path)?,
            candle_core::safetensors::load(path, device)?,
        ),
        CheckpointFormat::PyTorch => (HashMap::new(), read_pytorch_tensors(path, device)?),
    };
    let (vocab_size, vocab_source) = resolve_vocab_size(&metadata, &tensors);

    let config = AcousticConfig {
        vocab_size,
        ..sidecar_config(path)?
    };
    let parameters = tensors.values().map(|t| t.elem_count()).sum();
    let info = CheckpointInfo {
        path: path.to_path_buf(),
        config: config.clone(),
        tensors: tensors.len(),
        parameters,
        vocab_source,
    };

    let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
    let model = AcousticModel::new(config, vb)?;
    info!(
        "Loaded {} tensors ({} parameters), vocab {} from {:?}",
        info.tensors, info.parameters, vocab_size, vocab_source
    );
    Ok((model, info))
}

/// Write `tensors` as a safetensors checkpoint with `vocab_size` recorded in
/// the metadata.
pub fn write_checkpoint(
    path: &Path,
    tensors: &HashMap<String, Tensor>,
    vocab_size: Option<usize>,
) -> Result<()> {
    let metadata = vocab_size.map(|v| HashMap::from([(VOCAB_SIZE_KEY.to_string(), v.to_string())]));
    let mut entries: Vec<(&String, &Tensor)> = tensors.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    safetensors::serialize_to_file(entries, metadata, path)?;
    Ok(())
}

use candle_core::{DType, Device, Tensor};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::config::AdapterConfig;

pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const ADAPTER_WEIGHTS_BIN: &str = "adapter_model.bin";

#[derive(Debug, Error)]
pub enum LoraLoadError {
    #[error("adapter config: {0}")]
    Config(String),
    #[error("adapter weights not found in {0}")]
    WeightsNotFound(PathBuf),
    #[error("failed to load adapter weights: {0}")]
    WeightsLoad(String),
    #[error("missing lora_A or lora_B for module {0}")]
    IncompleteAdapter(String),
    #[error("adapter tensor {adapter_key} has no base weight {base_key}")]
    UnknownModule {
        adapter_key: String,
        base_key: String,
    },
    #[error("shape mismatch for {key}: base {base:?}, adapter {adapter:?}")]
    ShapeMismatch {
        key: String,
        base: Vec<usize>,
        adapter: Vec<usize>,
    },
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Low-rank pair for one layer.
///
/// Linear layers store `a` as `[r, in_features]` and `b` as
/// `[out_features, r]`. Embedding layers store `a` as `[r, num_embeddings]`
/// and `b` as `[embedding_dim, r]`, so their update is transposed.
#[derive(Debug, Clone)]
pub struct LoraPair {
    pub a: Tensor,
    pub b: Tensor,
    pub embedding: bool,
}

impl LoraPair {
    /// `scale * B @ A`, laid out like the base weight.
    pub fn delta(&self, scale: f64) -> candle_core::Result<Tensor> {
        let delta = (self.b.matmul(&self.a)? * scale)?;
        if self.embedding {
            delta.t()?.contiguous()
        } else {
            Ok(delta)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub merged: usize,
    pub replaced: usize,
}

#[derive(Debug)]
enum AdapterWeight {
    LoraA(String),
    LoraB(String),
    EmbeddingA(String),
    EmbeddingB(String),
    Full(String),
}

/// Maps a PEFT state-dict key onto the base model's naming.
///
/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight`
/// becomes `LoraA("model.layers.0.self_attn.q_proj")`, and
/// `base_model.model.lm_head.modules_to_save.default.weight` becomes
/// `Full("lm_head.weight")`.
fn classify(key: &str) -> AdapterWeight {
    let name = key
        .strip_prefix("base_model.model.")
        .or_else(|| key.strip_prefix("base_model."))
        .unwrap_or(key);

    let markers: [(&str, fn(String) -> AdapterWeight); 6] = [
        (".lora_embedding_A", AdapterWeight::EmbeddingA),
        (".lora_embedding_B", AdapterWeight::EmbeddingB),
        (".lora_A", AdapterWeight::LoraA),
        (".lora_a", AdapterWeight::LoraA),
        (".lora_B", AdapterWeight::LoraB),
        (".lora_b", AdapterWeight::LoraB),
    ];
    for (marker, kind) in markers {
        if let Some(pos) = name.find(marker) {
            return kind(name[..pos].to_string());
        }
    }

    AdapterWeight::Full(name.replace(".modules_to_save.default", ""))
}

/// A LoRA adapter read from a PEFT directory, ready to be folded into a set of
/// base weights.
#[derive(Debug)]
pub struct LoraAdapter {
    pub config: AdapterConfig,
    pub pairs: BTreeMap<String, LoraPair>,
    /// Full tensors (`modules_to_save`, trained biases) that replace their
    /// base counterparts.
    pub replacements: BTreeMap<String, Tensor>,
}

impl LoraAdapter {
    pub fn load(dir: &Path, device: &Device, dtype: DType) -> Result<Self, LoraLoadError> {
        let config = AdapterConfig::load(dir).map_err(|e| LoraLoadError::Config(e.to_string()))?;
        let tensors = load_weights(dir, device, dtype)?;
        Self::from_tensors(config, tensors)
    }

    pub fn from_tensors(
        config: AdapterConfig,
        tensors: HashMap<String, Tensor>,
    ) -> Result<Self, LoraLoadError> {
        let mut halves: BTreeMap<String, (Option<Tensor>, Option<Tensor>, bool)> = BTreeMap::new();
        let mut replacements = BTreeMap::new();

        for (key, tensor) in tensors {
            match classify(&key) {
                AdapterWeight::LoraA(module) => halves.entry(module).or_default().0 = Some(tensor),
                AdapterWeight::LoraB(module) => halves.entry(module).or_default().1 = Some(tensor),
                AdapterWeight::EmbeddingA(module) => {
                    let entry = halves.entry(module).or_default();
                    entry.0 = Some(tensor);
                    entry.2 = true;
                }
                AdapterWeight::EmbeddingB(module) => {
                    let entry = halves.entry(module).or_default();
                    entry.1 = Some(tensor);
                    entry.2 = true;
                }
                AdapterWeight::Full(name) => {
                    replacements.insert(name, tensor);
                }
            }
        }

        let mut pairs = BTreeMap::new();
        for (module, halves) in halves {
            let (a, b, embedding) = match halves {
                (Some(a), Some(b), embedding) => (a, b, embedding),
                _ => return Err(LoraLoadError::IncompleteAdapter(module)),
            };

            let (a_dims, b_dims) = (a.dims().to_vec(), b.dims().to_vec());
            if a_dims.len() != 2 || b_dims.len() != 2 || a_dims[0] != b_dims[1] {
                return Err(LoraLoadError::ShapeMismatch {
                    key: module,
                    base: a_dims,
                    adapter: b_dims,
                });
            }

            if !config.targets(&module) {
                tracing::warn!("adapter carries weights for {} outside target_modules", module);
            }
            pairs.insert(module, LoraPair { a, b, embedding });
        }

        Ok(Self {
            config,
            pairs,
            replacements,
        })
    }

    pub fn num_parameters(&self) -> usize {
        let pairs: usize = self
            .pairs
            .values()
            .map(|p| p.a.elem_count() + p.b.elem_count())
            .sum();
        let full: usize = self.replacements.values().map(|t| t.elem_count()).sum();
        pairs + full
    }

    /// Folds the adapter into `base`: `W' = W + (lora_alpha / r) * B @ A` for
    /// every linear pair (transposed for embeddings), and straight
    /// replacement for full tensors.
    ///
    /// Every adapter tensor must find a base tensor of the same shape.
    pub fn merge_into(&self, base: &mut HashMap<String, Tensor>) -> Result<MergeStats, LoraLoadError> {
        let scale = self.config.scaling();
        let mut stats = MergeStats::default();

        for (module, pair) in &self.pairs {
            let base_key = format!("{}.weight", module);
            let weight = base.get_mut(&base_key).ok_or_else(|| LoraLoadError::UnknownModule {
                adapter_key: module.clone(),
                base_key: base_key.clone(),
            })?;

            let delta = pair.delta(scale)?.to_dtype(weight.dtype())?;
            if delta.dims() != weight.dims() {
                return Err(LoraLoadError::ShapeMismatch {
                    key: base_key,
                    base: weight.dims().to_vec(),
                    adapter: delta.dims().to_vec(),
                });
            }

            *weight = weight.add(&delta)?;
            stats.merged += 1;
        }

        for (key, tensor) in &self.replacements {
            let weight = base.get_mut(key).ok_or_else(|| LoraLoadError::UnknownModule {
                adapter_key: key.clone(),
                base_key: key.clone(),
            })?;
            if tensor.dims() != weight.dims() {
                return Err(LoraLoadError::ShapeMismatch {
                    key: key.clone(),
                    base: weight.dims().to_vec(),
                    adapter: tensor.dims().to_vec(),
                });
            }
            *weight = tensor.to_dtype(weight.dtype())?;
            stats.replaced += 1;
        }

        Ok(stats)
    }
}

fn load_weights(
    dir: &Path,
    device: &Device,
    dtype: DType,
) -> Result<HashMap<String, Tensor>, LoraLoadError> {
    let safetensors_path = dir.join(ADAPTER_WEIGHTS_FILE);
    let raw: Vec<(String, Tensor)> = if safetensors_path.exists() {
        candle_core::safetensors::load(&safetensors_path, device)
            .map_err(|e| LoraLoadError::WeightsLoad(e.to_string()))?
            .into_iter()
            .collect()
    } else {
        let bin_path = dir.join(ADAPTER_WEIGHTS_BIN);
        if !bin_path.exists() {
            return Err(LoraLoadError::WeightsNotFound(dir.to_path_buf()));
        }
        candle_core::pickle::read_all(&bin_path)
            .map_err(|e| LoraLoadError::WeightsLoad(e.to_string()))?
    };

    let mut tensors = HashMap::with_capacity(raw.len());
    for (name, tensor) in raw {
        let tensor = tensor.to_device(device)?.to_dtype(dtype)?;
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

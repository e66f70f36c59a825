pub mod generation;

pub use generation::{GenerationConfig, TokenIds};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::adapter::{sanitize_adapter_dir, LoraAdapter, MergeStats};
use crate::core::Result;

/// Precision used for every tensor of the composed model.
pub const MODEL_DTYPE: DType = DType::F32;

/// A decoder that turns a token window into logits for the next position.
///
/// Implementations keep a KV cache between calls; `forward` with `offset`
/// > 0 continues the sequence fed so far.
pub trait CausalLm: Send {
    /// Returns `[vocab]` logits for the token following `input`.
    fn forward(&mut self, input: &[u32], offset: usize) -> Result<Tensor>;

    fn clear_cache(&mut self);
}

/// Local paths of the base model artifacts.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub generation_config: Option<PathBuf>,
}

/// Base model with the LoRA adapter folded into its weights. Inference only:
/// nothing in the forward pass depends on a training flag, and adapter
/// dropout is never applied.
pub struct ComposedModel {
    inner: qwen2::ModelForCausalLM,
    config: qwen2::Config,
    device: Device,
    merge: MergeStats,
}

impl ComposedModel {
    /// Sanitizes the adapter config, loads base and adapter weights on
    /// `device`, merges them and builds the model.
    pub fn load(base: &ModelFiles, adapter_dir: &Path, device: &Device) -> Result<Self> {
        let config_raw = std::fs::read_to_string(&base.config)
            .with_context(|| format!("failed to read {}", base.config.display()))?;
        let config: qwen2::Config =
            serde_json::from_str(&config_raw).context("unsupported base model config")?;

        let mut weights = load_weights(&base.weights, device)?;
        tracing::info!("loaded {} base tensors", weights.len());

        sanitize_adapter_dir(adapter_dir);
        let adapter = LoraAdapter::load(adapter_dir, device, MODEL_DTYPE)
            .with_context(|| format!("failed to load adapter from {}", adapter_dir.display()))?;
        tracing::info!(
            "adapter r={} alpha={} ({} params, {} lora pairs)",
            adapter.config.r,
            adapter.config.lora_alpha,
            adapter.num_parameters(),
            adapter.pairs.len()
        );
        if let Some(expected) = &adapter.config.base_model_name_or_path {
            tracing::debug!("adapter trained against {}", expected);
        }

        let merge = adapter.merge_into(&mut weights).context("failed to merge adapter")?;
        tracing::info!("merged {} matrices, replaced {} tensors", merge.merged, merge.replaced);

        Self::from_weights(config, weights, device, merge)
    }

    pub fn from_weights(
        config: qwen2::Config,
        weights: HashMap<String, Tensor>,
        device: &Device,
        merge: MergeStats,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(weights, MODEL_DTYPE, device);
        let inner = qwen2::ModelForCausalLM::new(&config, vb).context("failed to build model")?;
        Ok(Self {
            inner,
            config,
            device: device.clone(),
            merge,
        })
    }

    pub fn config(&self) -> &qwen2::Config {
        &self.config
    }

    pub fn merge_stats(&self) -> MergeStats {
        self.merge
    }
}

impl CausalLm for ComposedModel {
    fn forward(&mut self, input: &[u32], offset: usize) -> Result<Tensor> {
        let input = Tensor::new(input, &self.device)?.unsqueeze(0)?;
        let logits = self.inner.forward(&input, offset)?;
        Ok(logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?)
    }

    fn clear_cache(&mut self) {
        self.inner.clear_kv_cache();
    }
}

/// Reads every safetensors shard into memory in `MODEL_DTYPE`.
pub fn load_weights(paths: &[PathBuf], device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut weights = HashMap::new();
    for path in paths {
        let shard = candle_core::safetensors::load(path, device)
            .with_context(|| format!("failed to read {}", path.display()))?;
        for (name, tensor) in shard {
            weights.insert(name, tensor.to_dtype(MODEL_DTYPE)?);
        }
    }
    Ok(weights)
}

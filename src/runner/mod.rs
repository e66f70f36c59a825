use candle_core::Device;
use std::time::Instant;
use thiserror::Error;

use crate::core::model::{CausalLm, ComposedModel, GenerationConfig, ModelFiles};
use crate::core::tokenizer::{ChatMessage, ChatTokenizer, TokenizerError};
use crate::core::Result;
use crate::sample::{Sampler, SamplingParams, TOP_P};

pub const SYSTEM_PROMPT: &str = "You are a helpful, clear assistant.";
pub const EMPTY_PROMPT_MESSAGE: &str = "Please enter a prompt.";

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_NEW_TOKENS: usize = 200;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("temperature must be a positive number, got {0}")]
    InvalidTemperature(f64),
    #[error("max_new_tokens must be at least 1")]
    InvalidMaxTokens,
    #[error("prompt rendered to no attended tokens")]
    EmptyInput,
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Sampling(#[from] candle_core::Error),
    #[error("model forward failed: {0:#}")]
    Model(anyhow::Error),
}

impl GenerateError {
    /// Errors caused by the request itself rather than by the model.
    pub fn is_client_error(&self) -> bool {
        matches!(self, GenerateError::InvalidTemperature(_) | GenerateError::InvalidMaxTokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    pub max_new_tokens: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
        }
    }
}

impl GenerationParams {
    pub fn validate(&self) -> std::result::Result<(), GenerateError> {
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(GenerateError::InvalidTemperature(self.temperature));
        }
        if self.max_new_tokens == 0 {
            return Err(GenerateError::InvalidMaxTokens);
        }
        Ok(())
    }
}

/// Fixed system instruction followed by the trimmed user prompt.
pub fn transcript(prompt: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt.trim())]
}

/// `1` for every position that is not padding.
pub fn attention_mask(ids: &[u32], pad_id: u32) -> Vec<u8> {
    ids.iter().map(|&id| u8::from(id != pad_id)).collect()
}

/// Drops everything up to and including the first verbatim occurrence of
/// `prompt`. Text without the prompt is returned as decoded.
pub fn strip_prompt_echo(text: &str, prompt: &str) -> String {
    if prompt.is_empty() {
        return text.to_string();
    }
    match text.split_once(prompt) {
        Some((_, rest)) => rest.trim().to_string(),
        None => text.to_string(),
    }
}

/// Composed model, tokenizer and generation defaults, built once at startup.
pub struct Engine {
    model: Box<dyn CausalLm>,
    tokenizer: ChatTokenizer,
    generation: GenerationConfig,
    seed: Option<u64>,
}

impl Engine {
    pub fn new(model: Box<dyn CausalLm>, tokenizer: ChatTokenizer, generation: GenerationConfig) -> Self {
        Self {
            model,
            tokenizer,
            generation,
            seed: None,
        }
    }

    /// Loads the tokenizer and composed model from already fetched files.
    pub fn load(base: &ModelFiles, adapter_dir: &std::path::Path) -> Result<Self> {
        let tokenizer = ChatTokenizer::from_files(&base.tokenizer, base.tokenizer_config.as_deref())?;
        let generation = match &base.generation_config {
            Some(path) => GenerationConfig::from_file(path)?,
            None => GenerationConfig::default(),
        };
        let model = ComposedModel::load(base, adapter_dir, &Device::Cpu)?;
        let (config, merge) = (model.config(), model.merge_stats());
        tracing::info!(
            "composed model: {} layers, hidden {}, vocab {}; {} adapter matrices merged, {} tensors replaced",
            config.num_hidden_layers,
            config.hidden_size,
            config.vocab_size,
            merge.merged,
            merge.replaced
        );
        Ok(Self::new(Box::new(model), tokenizer, generation))
    }

    /// Fixed seed for every request; `None` draws a fresh one per call.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn tokenizer(&self) -> &ChatTokenizer {
        &self.tokenizer
    }

    fn sampling_params(&self, params: &GenerationParams) -> SamplingParams {
        SamplingParams {
            temperature: params.temperature,
            top_p: TOP_P,
            top_k: self.generation.top_k,
            repetition_penalty: self.generation.repetition_penalty.unwrap_or(1.0),
            seed: self.seed.unwrap_or_else(rand::random),
        }
    }

    /// Answers one prompt. Blank prompts get the advisory message without
    /// touching the model.
    pub fn generate_reply(&mut self, prompt: &str, params: &GenerationParams) -> std::result::Result<String, GenerateError> {
        if prompt.trim().is_empty() {
            return Ok(EMPTY_PROMPT_MESSAGE.to_string());
        }
        params.validate()?;

        let input_ids = self.tokenizer.apply_chat_template(&transcript(prompt))?;
        let output_ids = self.generate_ids(&input_ids, params)?;

        let text = self.tokenizer.decode(&output_ids, true)?;
        Ok(strip_prompt_echo(&text, prompt))
    }

    /// Samples up to `max_new_tokens` ids after `input_ids` and returns the
    /// whole sequence, prompt included.
    pub fn generate_ids(&mut self, input_ids: &[u32], params: &GenerationParams) -> std::result::Result<Vec<u32>, GenerateError> {
        let pad_id = self.tokenizer.pad_id();
        let mask = attention_mask(input_ids, pad_id);
        let context: Vec<u32> = input_ids
            .iter()
            .zip(&mask)
            .filter(|&(_, &m)| m == 1)
            .map(|(&id, _)| id)
            .collect();
        if context.is_empty() {
            return Err(GenerateError::EmptyInput);
        }

        let eos_ids = self.generation.eos_ids(self.tokenizer.eos_id());
        let mut sampler = Sampler::new(&self.sampling_params(params));
        let mut sequence = input_ids.to_vec();
        let start = Instant::now();

        self.model.clear_cache();
        let mut logits = self.model.forward(&context, 0).map_err(GenerateError::Model)?;
        let mut offset = context.len();

        for step in 0..params.max_new_tokens {
            let next = sampler.sample(&logits, &sequence)?;
            sequence.push(next);
            if eos_ids.contains(&next) || step + 1 == params.max_new_tokens {
                break;
            }
            logits = self.model.forward(&[next], offset).map_err(GenerateError::Model)?;
            offset += 1;
        }

        let generated = sequence.len() - input_ids.len();
        tracing::debug!(
            "prompt {} tokens ({} attended), generated {} in {:.2?}",
            input_ids.len(),
            context.len(),
            generated,
            start.elapsed()
        );
        Ok(sequence)
    }
}

use serde::Deserialize;
use std::path::Path;

/// `eos_token_id` is written either as one id or as a list.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::One(id) => vec![*id],
            TokenIds::Many(ids) => ids.clone(),
        }
    }
}

/// Defaults from the base model's `generation_config.json`. Explicit request
/// parameters win over these.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
}

impl GenerationConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Stop ids, falling back to the tokenizer's eos id.
    pub fn eos_ids(&self, tokenizer_eos: u32) -> Vec<u32> {
        match &self.eos_token_id {
            Some(ids) => {
                let mut ids = ids.to_vec();
                if ids.is_empty() {
                    ids.push(tokenizer_eos);
                }
                ids
            }
            None => vec![tokenizer_eos],
        }
    }
}

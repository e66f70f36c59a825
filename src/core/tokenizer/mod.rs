pub mod template;

pub use template::{ChatMessage, ChatTemplate, TemplateError, CHATML_TEMPLATE};

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tokenizers::{PaddingParams, Tokenizer};

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("tokenizer: {0}")]
    Tokenizers(String),
    #[error("failed to read tokenizer config: {0}")]
    Config(String),
    #[error("token {0:?} is not in the vocabulary")]
    UnknownToken(String),
    #[error("tokenizer defines no end-of-sequence token")]
    MissingEos,
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Special tokens come either as bare strings or as `AddedToken` objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Plain(String),
    Dict { content: String },
}

impl SpecialToken {
    fn into_string(self) -> String {
        match self {
            SpecialToken::Plain(s) => s,
            SpecialToken::Dict { content } => content,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NamedTemplate {
    name: String,
    template: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TemplateSource {
    Single(String),
    Named(Vec<NamedTemplate>),
}

/// The subset of `tokenizer_config.json` used here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default)]
    chat_template: Option<TemplateSource>,
    #[serde(default)]
    bos_token: Option<SpecialToken>,
    #[serde(default)]
    eos_token: Option<SpecialToken>,
    #[serde(default)]
    pad_token: Option<SpecialToken>,
}

impl TokenizerConfig {
    pub fn from_file(path: &Path) -> Result<Self, TokenizerError> {
        let raw = std::fs::read_to_string(path).map_err(|e| TokenizerError::Config(e.to_string()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, TokenizerError> {
        serde_json::from_str(raw).map_err(|e| TokenizerError::Config(e.to_string()))
    }

    fn template_source(&self) -> Option<String> {
        match self.chat_template.as_ref()? {
            TemplateSource::Single(s) => Some(s.clone()),
            TemplateSource::Named(list) => list
                .iter()
                .find(|t| t.name == "default")
                .or_else(|| list.first())
                .map(|t| t.template.clone()),
        }
    }
}

/// `tokenizers::Tokenizer` plus the chat template and special-token ids
/// needed for generation.
pub struct ChatTokenizer {
    inner: Tokenizer,
    template: ChatTemplate,
    eos_id: u32,
    pad_token: String,
    pad_id: u32,
}

impl ChatTokenizer {
    pub fn from_files(tokenizer_json: &Path, tokenizer_config: Option<&Path>) -> Result<Self, TokenizerError> {
        let inner = Tokenizer::from_file(tokenizer_json).map_err(|e| TokenizerError::Tokenizers(e.to_string()))?;
        let config = match tokenizer_config {
            Some(path) => TokenizerConfig::from_file(path)?,
            None => TokenizerConfig::default(),
        };
        Self::new(inner, config)
    }

    /// Resolves special tokens and installs the padding token on the
    /// tokenizer. A tokenizer without a pad token pads with its eos token.
    pub fn new(mut inner: Tokenizer, config: TokenizerConfig) -> Result<Self, TokenizerError> {
        let eos_token = config
            .eos_token
            .clone()
            .map(SpecialToken::into_string)
            .ok_or(TokenizerError::MissingEos)?;
        let eos_id = inner
            .token_to_id(&eos_token)
            .ok_or_else(|| TokenizerError::UnknownToken(eos_token.clone()))?;

        let (pad_token, pad_id) = match config.pad_token.clone().map(SpecialToken::into_string) {
            Some(pad) => {
                let id = inner
                    .token_to_id(&pad)
                    .ok_or_else(|| TokenizerError::UnknownToken(pad.clone()))?;
                (pad, id)
            }
            None => {
                tracing::info!("tokenizer has no pad token, using eos {:?}", eos_token);
                (eos_token.clone(), eos_id)
            }
        };

        inner.with_padding(Some(PaddingParams {
            pad_id,
            pad_token: pad_token.clone(),
            ..Default::default()
        }));

        let bos_token = config
            .bos_token
            .clone()
            .map(SpecialToken::into_string)
            .unwrap_or_default();
        let template = match config.template_source() {
            Some(source) => ChatTemplate::new(source, bos_token, eos_token),
            None => {
                tracing::warn!("tokenizer config has no chat_template, falling back to ChatML");
                ChatTemplate::chatml(eos_token)
            }
        };

        Ok(Self {
            inner,
            template,
            eos_id,
            pad_token,
            pad_id,
        })
    }

    /// Renders the transcript with the assistant turn opened and tokenizes it
    /// as-is: the template already places every special token.
    pub fn apply_chat_template(&self, messages: &[ChatMessage]) -> Result<Vec<u32>, TokenizerError> {
        let rendered = self.template.apply(messages, true)?;
        self.encode(&rendered)
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| TokenizerError::Tokenizers(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TokenizerError> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| TokenizerError::Tokenizers(e.to_string()))
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn pad_token(&self) -> &str {
        &self.pad_token
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn padding(&self) -> Option<&PaddingParams> {
        self.inner.get_padding()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::word_tokenizer;
    use super::*;

    #[test]
    fn test_pad_falls_back_to_eos() {
        let config = TokenizerConfig::from_json(r#"{"eos_token": "<|im_end|>", "pad_token": null}"#).unwrap();
        let tok = ChatTokenizer::new(word_tokenizer(&["hello"]), config).unwrap();
        assert_eq!(tok.pad_token(), "<|im_end|>");
        assert_eq!(tok.pad_id(), tok.eos_id());
        assert_eq!(tok.padding().unwrap().pad_id, tok.eos_id());
    }

    #[test]
    fn test_explicit_pad_token_is_kept() {
        let config = TokenizerConfig::from_json(
            r#"{"eos_token": {"content": "<|im_end|>", "special": true}, "pad_token": "<|endoftext|>"}"#,
        )
        .unwrap();
        let tok = ChatTokenizer::new(word_tokenizer(&["hello"]), config).unwrap();
        assert_eq!(tok.pad_token(), "<|endoftext|>");
        assert_ne!(tok.pad_id(), tok.eos_id());
    }

    #[test]
    fn test_missing_eos_is_an_error() {
        let err = ChatTokenizer::new(word_tokenizer(&["hello"]), TokenizerConfig::default()).err();
        assert!(matches!(err, Some(TokenizerError::MissingEos)));
    }

    #[test]
    fn test_chat_template_tokenizes_specials() {
        let config = TokenizerConfig::from_json(r#"{"eos_token": "<|im_end|>"}"#).unwrap();
        let tok = ChatTokenizer::new(word_tokenizer(&["system", "user", "assistant", "hi"]), config).unwrap();
        let ids = tok
            .apply_chat_template(&[ChatMessage::system("hi"), ChatMessage::user("hi")])
            .unwrap();
        let start = tok.token_to_id("<|im_start|>").unwrap();
        assert_eq!(ids.first(), Some(&start));
        assert_eq!(ids.iter().filter(|&&id| id == tok.eos_id()).count(), 2);
        assert_eq!(tok.decode(&ids, true).unwrap(), "system hi user hi assistant");
    }

    #[test]
    fn test_named_templates_prefer_default() {
        let config = TokenizerConfig::from_json(
            r#"{"chat_template": [{"name": "tool_use", "template": "T"}, {"name": "default", "template": "D"}]}"#,
        )
        .unwrap();
        assert_eq!(config.template_source().as_deref(), Some("D"));
    }
}

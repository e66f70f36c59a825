use minijinja::{Environment, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Plain ChatML, used when `tokenizer_config.json` ships no template.
pub const CHATML_TEMPLATE: &str = "{% for message in messages %}<|im_start|>{{ message.role }}\n{{ message.content }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("chat template error: {0}")]
    Render(#[from] minijinja::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A Jinja chat template as shipped in `tokenizer_config.json`.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    source: String,
    bos_token: String,
    eos_token: String,
}

impl ChatTemplate {
    pub fn new(source: impl Into<String>, bos_token: impl Into<String>, eos_token: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            bos_token: bos_token.into(),
            eos_token: eos_token.into(),
        }
    }

    pub fn chatml(eos_token: impl Into<String>) -> Self {
        Self::new(CHATML_TEMPLATE, "", eos_token)
    }

    /// Renders `messages` into the prompt string the model expects.
    pub fn apply(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String, TemplateError> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_function("raise_exception", |msg: String| -> Result<String, minijinja::Error> {
            Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
        });
        env.add_template("chat", &self.source)?;

        let tmpl = env.get_template("chat")?;
        let rendered = tmpl.render(minijinja::context! {
            messages => messages,
            bos_token => &self.bos_token,
            eos_token => &self.eos_token,
            add_generation_prompt => add_generation_prompt,
        })?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You are a helpful, clear assistant."),
            ChatMessage::user("Hello"),
        ]
    }

    #[test]
    fn test_chatml_with_generation_prompt() {
        let rendered = ChatTemplate::chatml("<|im_end|>").apply(&transcript(), true).unwrap();
        assert_eq!(
            rendered,
            "<|im_start|>system\nYou are a helpful, clear assistant.<|im_end|>\n\
             <|im_start|>user\nHello<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_chatml_without_generation_prompt() {
        let rendered = ChatTemplate::chatml("<|im_end|>").apply(&transcript(), false).unwrap();
        assert!(rendered.ends_with("Hello<|im_end|>\n"));
        assert!(!rendered.contains("assistant"));
    }

    #[test]
    fn test_special_tokens_are_exposed() {
        let template = ChatTemplate::new(
            "{{ bos_token }}{% for m in messages %}{{ m.content }}{% endfor %}{{ eos_token }}",
            "<s>",
            "</s>",
        );
        assert_eq!(template.apply(&transcript(), false).unwrap(), "<s>You are a helpful, clear assistant.Hello</s>");
    }

    #[test]
    fn test_raise_exception_surfaces_as_error() {
        let template = ChatTemplate::new(
            "{% if messages[0].role != 'user' %}{{ raise_exception('first message must be user') }}{% endif %}",
            "",
            "",
        );
        assert!(template.apply(&transcript(), true).is_err());
    }
}

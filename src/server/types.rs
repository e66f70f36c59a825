use serde::{Deserialize, Serialize};

use super::ServerError;
use crate::runner::{GenerationParams, DEFAULT_MAX_NEW_TOKENS, DEFAULT_TEMPERATURE};

/// A numeric knob sent either as a JSON number or as its text form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Number(f64),
    Text(String),
}

impl Numeric {
    pub fn to_f64(&self, field: &'static str) -> Result<f64, ServerError> {
        let value = match self {
            Numeric::Number(n) => *n,
            Numeric::Text(s) => s.trim().parse().map_err(|_| ServerError::InvalidNumber {
                field,
                value: s.clone(),
            })?,
        };
        if value.is_nan() {
            return Err(ServerError::InvalidNumber {
                field,
                value: value.to_string(),
            });
        }
        Ok(value)
    }

    /// Integer coercion truncates toward zero; `"200"`, `200` and `200.9`
    /// all give 200.
    pub fn to_count(&self, field: &'static str) -> Result<usize, ServerError> {
        let value = self.to_f64(field)?;
        if !value.is_finite() || value < 0.0 {
            return Err(ServerError::InvalidNumber {
                field,
                value: value.to_string(),
            });
        }
        Ok(value.trunc() as usize)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub temperature: Option<Numeric>,
    #[serde(default)]
    pub max_new_tokens: Option<Numeric>,
}

impl GenerateRequest {
    /// Coerced knobs. A blank prompt never reaches the model, so its knobs
    /// are not read and defaults stand in.
    pub fn params(&self) -> Result<GenerationParams, ServerError> {
        if self.prompt.trim().is_empty() {
            return Ok(GenerationParams::default());
        }
        Ok(GenerationParams {
            temperature: match &self.temperature {
                Some(t) => t.to_f64("temperature")?,
                None => DEFAULT_TEMPERATURE,
            },
            max_new_tokens: match &self.max_new_tokens {
                Some(n) => n.to_count("max_new_tokens")?,
                None => DEFAULT_MAX_NEW_TOKENS,
            },
        })
    }
}

/// Url-encoded body of the browser form. Every field arrives as text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormInput {
    #[serde(default)]
    pub prompt: String,
    pub temperature: Option<String>,
    pub max_new_tokens: Option<String>,
}

impl From<FormInput> for GenerateRequest {
    fn from(form: FormInput) -> Self {
        let present = |v: Option<String>| v.filter(|s| !s.trim().is_empty()).map(Numeric::Text);
        Self {
            prompt: form.prompt,
            temperature: present(form.temperature),
            max_new_tokens: present(form.max_new_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub output: String,
    pub created_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

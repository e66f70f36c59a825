pub mod adapter;
pub mod model;
pub mod tokenizer;

pub use adapter::{AdapterConfig, LoraAdapter, SanitizeOutcome};
pub use model::{CausalLm, ComposedModel, GenerationConfig, ModelFiles};
pub use tokenizer::{ChatMessage, ChatTemplate, ChatTokenizer};

pub type Result<T> = anyhow::Result<T>;

pub mod cmd;
pub mod core;
pub mod envconfig;
pub mod format;
pub mod infra;
pub mod middleware;
pub mod progress;
pub mod runner;
pub mod sample;
pub mod server;

pub use self::core::{
    AdapterConfig, CausalLm, ChatMessage, ChatTemplate, ChatTokenizer, ComposedModel, GenerationConfig,
    LoraAdapter, ModelFiles, Result, SanitizeOutcome,
};
pub use envconfig::EnvConfig;
pub use infra::Hub;
pub use runner::{Engine, GenerateError, GenerationParams};
pub use server::{router, AppState};

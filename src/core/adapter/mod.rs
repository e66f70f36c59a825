pub mod config;
pub mod lora;

pub use config::{
    sanitize, sanitize_adapter_dir, sanitize_file, AdapterConfig, SanitizeError, SanitizeOutcome,
    ADAPTER_CONFIG_FILE, ALLOWED_KEYS,
};
pub use lora::{LoraAdapter, LoraLoadError, LoraPair, MergeStats};

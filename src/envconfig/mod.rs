use std::env;
use std::path::PathBuf;

pub const DEFAULT_BASE_MODEL: &str = "Qwen/Qwen2.5-0.5B-Instruct";
pub const DEFAULT_ADAPTER: &str = "christiancadena/qwen2.5-0.5b-dpo-lora";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7860;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub host: Host,
    /// Hub repository id or local directory of the base model.
    pub base_model: String,
    /// Hub repository id or local directory of the LoRA adapter.
    pub adapter: String,
    pub cache_dir: Option<PathBuf>,
    /// Compute threads for tensor ops.
    pub threads: usize,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub host: String,
    pub port: u16,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            host: Host::from_env(),
            base_model: env::var("RLHF_BASE_MODEL").unwrap_or_else(|_| DEFAULT_BASE_MODEL.to_string()),
            adapter: env::var("RLHF_ADAPTER").unwrap_or_else(|_| DEFAULT_ADAPTER.to_string()),
            cache_dir: env::var("RLHF_CACHE_DIR").ok().map(|p| expand_home(&p)),
            threads: env::var("RLHF_THREADS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(1),
            seed: env::var("RLHF_SEED").ok().and_then(|v| v.parse().ok()),
        }
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Host {
    pub fn from_env() -> Self {
        match env::var("RLHF_HOST") {
            Ok(value) => Self::parse(&value),
            Err(_) => Self {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
            },
        }
    }

    /// `host`, `host:port` or `:port`.
    pub fn parse(value: &str) -> Self {
        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().unwrap_or(DEFAULT_PORT)),
            None => (value, DEFAULT_PORT),
        };
        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        Self {
            host: host.to_string(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

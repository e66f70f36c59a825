use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::core::adapter::{sanitize_adapter_dir, sanitize_file, SanitizeOutcome, ADAPTER_CONFIG_FILE};
use crate::core::ModelFiles;
use crate::envconfig::EnvConfig;
use crate::format::{human_bytes, total_size};
use crate::infra::Hub;
use crate::progress::Progress;
use crate::runner::{Engine, GenerationParams};
use crate::server::{self, AppState};

/// Pins tensor compute to `threads` workers. Must run before any model work.
pub fn init_threads(threads: usize) {
    std::env::set_var("RAYON_NUM_THREADS", threads.to_string());
    match rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
        Ok(()) => tracing::debug!("compute pool pinned to {} thread(s)", threads),
        Err(e) => tracing::warn!("compute pool already initialised: {}", e),
    }
}

/// Adapter snapshot directory and base model files, downloaded if needed.
async fn fetch_artifacts(config: &EnvConfig, progress: &mut Progress) -> Result<(PathBuf, ModelFiles)> {
    let hub = Hub::new(config.cache_dir.clone(), true)?;

    progress.spinner(&format!("fetching adapter {}", config.adapter));
    let adapter_dir = hub
        .snapshot(&config.adapter)
        .await
        .with_context(|| format!("failed to fetch adapter {}", config.adapter))?;
    progress.finish(&format!("adapter ready at {}", adapter_dir.display()));

    progress.spinner(&format!("fetching base model {}", config.base_model));
    let base = hub
        .fetch_model(&config.base_model)
        .await
        .with_context(|| format!("failed to fetch base model {}", config.base_model))?;
    progress.finish(&format!("base model ready ({})", human_bytes(total_size(&base.weights))));

    Ok((adapter_dir, base))
}

/// Fetches everything, merges the adapter and returns a ready engine.
pub async fn load_engine(config: &EnvConfig) -> Result<Engine> {
    init_threads(config.threads);

    let mut progress = Progress::new();
    let (adapter_dir, base) = fetch_artifacts(config, &mut progress).await?;

    progress.spinner("merging adapter into base model");
    let engine = tokio::task::spawn_blocking(move || Engine::load(&base, &adapter_dir))
        .await
        .context("model loading task panicked")??;
    progress.finish("model ready");

    Ok(engine.with_seed(config.seed))
}

pub async fn serve(config: &EnvConfig) -> Result<()> {
    let engine = load_engine(config).await?;
    let state = AppState::new(engine);
    server::serve(state, &config.host).await?;
    Ok(())
}

pub async fn generate(config: &EnvConfig, prompt: &str, params: GenerationParams) -> Result<()> {
    let engine = load_engine(config).await?;
    let state = AppState::new(engine);
    let output = server::run_generation(&state, prompt.to_string(), params).await?;
    println!("{}", output);
    Ok(())
}

/// Sanitizes a config file, or the `adapter_config.json` inside a directory.
pub fn sanitize(path: &Path) -> Result<()> {
    let file = if path.is_dir() {
        path.join(ADAPTER_CONFIG_FILE)
    } else {
        path.to_path_buf()
    };

    match sanitize_file(&file).with_context(|| format!("failed to sanitize {}", file.display()))? {
        SanitizeOutcome::Unchanged => println!("{}: already clean", file.display()),
        SanitizeOutcome::Rewritten { dropped } => {
            println!("{}: removed {}", file.display(), dropped.join(", "))
        }
    }
    Ok(())
}

pub async fn fetch(config: &EnvConfig) -> Result<()> {
    let mut progress = Progress::new();
    let (adapter_dir, base) = fetch_artifacts(config, &mut progress).await?;
    sanitize_adapter_dir(&adapter_dir);

    println!("adapter:    {}", adapter_dir.display());
    println!("config:     {}", base.config.display());
    println!("tokenizer:  {}", base.tokenizer.display());
    for weights in &base.weights {
        println!("weights:    {}", weights.display());
    }
    Ok(())
}

pub fn version() -> Result<()> {
    println!("rlhf-mini version {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

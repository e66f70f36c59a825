use anyhow::{bail, Context};
use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use std::path::{Path, PathBuf};

use crate::core::adapter::ADAPTER_CONFIG_FILE;
use crate::core::{ModelFiles, Result};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Resolves model sources to local files. A source is either an existing
/// directory or a hub repository id fetched into the local cache.
pub struct Hub {
    api: Api,
}

impl Hub {
    pub fn new(cache_dir: Option<PathBuf>, progress: bool) -> Result<Self> {
        let mut builder = ApiBuilder::new().with_progress(progress);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir);
        }
        let api = builder.build().context("failed to initialise hub client")?;
        Ok(Self { api })
    }

    fn repo(&self, repo_id: &str) -> ApiRepo {
        self.api.model(repo_id.to_string())
    }

    /// Base model config, tokenizer and weights.
    pub async fn fetch_model(&self, source: &str) -> Result<ModelFiles> {
        let local = Path::new(source);
        if local.is_dir() {
            return local_model_files(local);
        }

        tracing::info!("fetching {} from the hub", source);
        let repo = self.repo(source);
        let config = repo
            .get(CONFIG_FILE)
            .await
            .with_context(|| format!("{}: missing {}", source, CONFIG_FILE))?;
        let tokenizer = repo
            .get(TOKENIZER_FILE)
            .await
            .with_context(|| format!("{}: missing {}", source, TOKENIZER_FILE))?;
        let tokenizer_config = repo.get(TOKENIZER_CONFIG_FILE).await.ok();
        let generation_config = repo.get(GENERATION_CONFIG_FILE).await.ok();

        let weights = match repo.get(SINGLE_WEIGHTS_FILE).await {
            Ok(path) => vec![path],
            Err(_) => {
                let index = repo
                    .get(WEIGHTS_INDEX_FILE)
                    .await
                    .with_context(|| format!("{}: no safetensors weights", source))?;
                let mut paths = Vec::new();
                for shard in shard_names(&index)? {
                    paths.push(repo.get(&shard).await.with_context(|| format!("{}: missing {}", source, shard))?);
                }
                paths
            }
        };

        Ok(ModelFiles {
            config,
            weights,
            tokenizer,
            tokenizer_config,
            generation_config,
        })
    }

    /// Downloads every file of the repository and returns the snapshot
    /// directory holding them.
    pub async fn snapshot(&self, source: &str) -> Result<PathBuf> {
        let local = Path::new(source);
        if local.is_dir() {
            return Ok(local.to_path_buf());
        }

        tracing::info!("fetching snapshot of {}", source);
        let repo = self.repo(source);
        let info = repo
            .info()
            .await
            .with_context(|| format!("failed to list files of {}", source))?;

        let mut root = None;
        for sibling in &info.siblings {
            let path = repo
                .get(&sibling.rfilename)
                .await
                .with_context(|| format!("{}: failed to fetch {}", source, sibling.rfilename))?;
            if root.is_none() || sibling.rfilename == ADAPTER_CONFIG_FILE {
                root = snapshot_root(&path, &sibling.rfilename);
            }
        }

        match root {
            Some(root) => Ok(root),
            None => bail!("{} has no files", source),
        }
    }
}

/// Strips the repository-relative `rfilename` off a fetched file path.
fn snapshot_root(path: &Path, rfilename: &str) -> Option<PathBuf> {
    let depth = Path::new(rfilename).components().count();
    path.ancestors().nth(depth).map(Path::to_path_buf)
}

fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(index_path)?;
    let index: serde_json::Value = serde_json::from_str(&raw)?;
    let map = index["weight_map"]
        .as_object()
        .context("missing weight_map in safetensors index")?;

    let mut names: Vec<String> = map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

fn local_model_files(dir: &Path) -> Result<ModelFiles> {
    let require = |name: &str| -> Result<PathBuf> {
        let path = dir.join(name);
        if !path.exists() {
            bail!("{} not found in {}", name, dir.display());
        }
        Ok(path)
    };
    let optional = |name: &str| Some(dir.join(name)).filter(|p| p.exists());

    let single = dir.join(SINGLE_WEIGHTS_FILE);
    let weights = if single.exists() {
        vec![single]
    } else {
        let index = require(WEIGHTS_INDEX_FILE)?;
        shard_names(&index)?.into_iter().map(|s| dir.join(s)).collect()
    };

    Ok(ModelFiles {
        config: require(CONFIG_FILE)?,
        weights,
        tokenizer: require(TOKENIZER_FILE)?,
        tokenizer_config: optional(TOKENIZER_CONFIG_FILE),
        generation_config: optional(GENERATION_CONFIG_FILE),
    })
}

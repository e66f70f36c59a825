use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Keys a strict LoRA config loader accepts. Anything else written by the
/// training tool is dropped before the adapter is loaded.
pub const ALLOWED_KEYS: [&str; 11] = [
    "peft_type",
    "auto_mapping",
    "base_model_name_or_path",
    "bias",
    "inference_mode",
    "modules_to_save",
    "r",
    "lora_alpha",
    "lora_dropout",
    "target_modules",
    "task_type",
];

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to encode sanitized config: {0}")]
    Encode(serde_json::Error),
    #[error("{0} does not contain a JSON object")]
    NotAnObject(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanitizeOutcome {
    Unchanged,
    Rewritten { dropped: Vec<String> },
}

pub fn is_allowed(key: &str) -> bool {
    ALLOWED_KEYS.contains(&key)
}

/// Returns a copy of `config` holding only allow-listed keys.
pub fn sanitize(config: &Map<String, Value>) -> Map<String, Value> {
    config
        .iter()
        .filter(|(k, _)| is_allowed(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Filters the config file in place. The file is only rewritten when at
/// least one key was dropped.
pub fn sanitize_file(path: &Path) -> Result<SanitizeOutcome, SanitizeError> {
    let raw = fs::read_to_string(path).map_err(|source| SanitizeError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let value: Value = serde_json::from_str(&raw).map_err(|source| SanitizeError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let original = match value {
        Value::Object(map) => map,
        _ => return Err(SanitizeError::NotAnObject(path.to_path_buf())),
    };

    let cleaned = sanitize(&original);
    if cleaned == original {
        return Ok(SanitizeOutcome::Unchanged);
    }

    let dropped: Vec<String> = original
        .keys()
        .filter(|k| !cleaned.contains_key(*k))
        .cloned()
        .collect();

    let body = serde_json::to_string(&Value::Object(cleaned)).map_err(SanitizeError::Encode)?;
    fs::write(path, body).map_err(|source| SanitizeError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(SanitizeOutcome::Rewritten { dropped })
}

/// Best-effort sanitation of `<dir>/adapter_config.json`.
///
/// A missing file is skipped. Read, parse and write failures are logged and
/// swallowed so that the adapter loader gets a chance to accept the file as
/// it is.
pub fn sanitize_adapter_dir(dir: &Path) -> Option<SanitizeOutcome> {
    let path = dir.join(ADAPTER_CONFIG_FILE);
    if !path.exists() {
        tracing::debug!("no {} in {}, skipping sanitation", ADAPTER_CONFIG_FILE, dir.display());
        return None;
    }

    match sanitize_file(&path) {
        Ok(SanitizeOutcome::Unchanged) => {
            tracing::debug!("{} already clean", path.display());
            Some(SanitizeOutcome::Unchanged)
        }
        Ok(SanitizeOutcome::Rewritten { dropped }) => {
            tracing::info!("sanitized {} (dropped: {})", path.display(), dropped.join(", "));
            Some(SanitizeOutcome::Rewritten { dropped })
        }
        Err(e) => {
            tracing::warn!("could not sanitize {}: {}", ADAPTER_CONFIG_FILE, e);
            None
        }
    }
}

/// Typed view over a sanitized adapter config, used by the merge step.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub peft_type: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub lora_dropout: f64,
    #[serde(default)]
    pub target_modules: Option<TargetModules>,
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default)]
    pub inference_mode: bool,
}

fn default_bias() -> String {
    "none".to_string()
}

/// PEFT writes `target_modules` either as a list of module names or as a
/// single regex string.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

impl Default for TargetModules {
    fn default() -> Self {
        TargetModules::List(Vec::new())
    }
}

impl TargetModules {
    /// Whether a module path like `model.layers.0.self_attn.q_proj` is
    /// covered. A pattern must match the whole path.
    pub fn covers(&self, module_path: &str) -> bool {
        match self {
            TargetModules::List(names) => {
                names.is_empty()
                    || names
                        .iter()
                        .any(|n| module_path == n || module_path.ends_with(&format!(".{}", n)))
            }
            TargetModules::Pattern(pattern) => {
                full_match(pattern).is_ok_and(|re| re.is_match(module_path))
            }
        }
    }
}

fn full_match(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

impl AdapterConfig {
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(ADAPTER_CONFIG_FILE);
        let raw = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        let map = match value {
            Value::Object(map) => map,
            _ => anyhow::bail!("adapter config is not a JSON object"),
        };
        // Unknown keys never reach the typed config, sanitized on disk or not.
        let config: AdapterConfig = serde_json::from_value(Value::Object(sanitize(&map)))?;
        if config.r == 0 {
            anyhow::bail!("adapter config has r = 0");
        }
        if let Some(TargetModules::Pattern(pattern)) = &config.target_modules {
            full_match(pattern)
                .map_err(|e| anyhow::anyhow!("invalid target_modules pattern {:?}: {}", pattern, e))?;
        }
        Ok(config)
    }

    /// Whether the adapter is expected to carry a LoRA pair for `module_path`.
    pub fn targets(&self, module_path: &str) -> bool {
        self.target_modules
            .as_ref()
            .map_or(true, |t| t.covers(module_path))
    }

    /// LoRA update scale, `lora_alpha / r`.
    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rlhf_mini_sanitize_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_sanitize_drops_unknown_keys() {
        let config = object(json!({
            "peft_type": "LORA",
            "r": 8,
            "lora_alpha": 16,
            "foo": "bar",
            "use_dora": false
        }));
        let cleaned = sanitize(&config);
        assert_eq!(cleaned.len(), 3);
        assert!(!cleaned.contains_key("foo"));
        assert!(!cleaned.contains_key("use_dora"));
        assert_eq!(cleaned["r"], json!(8));
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let config = object(json!({
            "r": 16,
            "target_modules": ["q_proj", "v_proj"],
            "layers_pattern": null,
            "eva_config": {"rho": 2.0}
        }));
        let once = sanitize(&config);
        let twice = sanitize(&once);
        assert_eq!(once, twice);
        assert!(once.keys().all(|k| is_allowed(k)));
    }

    #[test]
    fn test_sanitize_file_rewrites_only_when_changed() {
        let dir = scratch_dir("rewrite");
        let path = dir.join(ADAPTER_CONFIG_FILE);
        fs::write(&path, r#"{"r": 8, "lora_alpha": 16, "foo": "bar"}"#).unwrap();

        let outcome = sanitize_file(&path).unwrap();
        assert_eq!(
            outcome,
            SanitizeOutcome::Rewritten {
                dropped: vec!["foo".to_string()]
            }
        );

        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, json!({"r": 8, "lora_alpha": 16}));

        let before = fs::read_to_string(&path).unwrap();
        assert_eq!(sanitize_file(&path).unwrap(), SanitizeOutcome::Unchanged);
        assert_eq!(fs::read_to_string(&path).unwrap(), before);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_sanitize_file_rejects_non_object() {
        let dir = scratch_dir("array");
        let path = dir.join(ADAPTER_CONFIG_FILE);
        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(matches!(sanitize_file(&path), Err(SanitizeError::NotAnObject(_))));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_sanitize_adapter_dir_swallows_parse_errors() {
        let dir = scratch_dir("broken");
        fs::write(dir.join(ADAPTER_CONFIG_FILE), "{not json").unwrap();
        assert_eq!(sanitize_adapter_dir(&dir), None);
        // Left untouched for the loader to report.
        assert_eq!(fs::read_to_string(dir.join(ADAPTER_CONFIG_FILE)).unwrap(), "{not json");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_sanitize_adapter_dir_missing_file() {
        let dir = scratch_dir("missing");
        assert_eq!(sanitize_adapter_dir(&dir), None);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_adapter_config_ignores_unknown_fields() {
        let config = AdapterConfig::from_json(
            r#"{
                "peft_type": "LORA",
                "r": 16,
                "lora_alpha": 32,
                "lora_dropout": 0.05,
                "target_modules": ["q_proj", "k_proj", "v_proj", "o_proj"],
                "use_rslora": true,
                "task_type": "CAUSAL_LM"
            }"#,
        )
        .unwrap();
        assert_eq!(config.r, 16);
        assert!((config.scaling() - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.bias, "none");
        assert!(config.targets("model.layers.3.self_attn.q_proj"));
        assert!(!config.targets("model.layers.3.mlp.up_proj"));
    }

    #[test]
    fn test_adapter_config_pattern_target() {
        let config =
            AdapterConfig::from_json(r#"{"r": 4, "lora_alpha": 8, "target_modules": ".*proj"}"#).unwrap();
        assert_eq!(config.target_modules, Some(TargetModules::Pattern(".*proj".to_string())));
        assert!(config.targets("model.layers.0.mlp.down_proj"));
        assert!(!config.targets("model.layers.0.input_layernorm"));
    }

    #[test]
    fn test_pattern_target_is_a_full_match() {
        let config = AdapterConfig::from_json(
            r#"{"r": 4, "lora_alpha": 8, "target_modules": ".*\.(q_proj|v_proj)"}"#,
        )
        .unwrap();
        assert!(config.targets("model.layers.0.self_attn.q_proj"));
        assert!(config.targets("model.layers.11.self_attn.v_proj"));
        assert!(!config.targets("model.layers.0.mlp.up_proj"));

        let bare = AdapterConfig::from_json(r#"{"r": 4, "lora_alpha": 8, "target_modules": "q_proj"}"#).unwrap();
        assert!(bare.targets("q_proj"));
        assert!(!bare.targets("model.layers.0.self_attn.q_proj"));
    }

    #[test]
    fn test_invalid_target_pattern_is_rejected() {
        let err = AdapterConfig::from_json(r#"{"r": 4, "lora_alpha": 8, "target_modules": "(q_proj"}"#).unwrap_err();
        assert!(err.to_string().contains("target_modules"));
    }

    #[test]
    fn test_adapter_config_rejects_zero_rank() {
        assert!(AdapterConfig::from_json(r#"{"r": 0, "lora_alpha": 8}"#).is_err());
    }
}

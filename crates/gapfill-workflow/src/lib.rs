#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use gapfill_domain::{
    ensure_non_empty, hash_bytes, hash_json, BrowseTarget, DataVariant, DocumentKey, PeriodKind,
    StatementKind,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const NORMALIZATION_VERSION: u32 = 1;
pub const MIN_ITERATIONS: u32 = 1;
pub const MAX_ITERATIONS: u32 = 50;
pub const DEFAULT_ITERATIONS: u32 = 15;

pub const DEFAULT_PIPELINE_YAML: &str = r#"
pipeline_name: financial-gapfill
pipeline_version: v1
documents:
  - { key: financials-annual-income, statement_kind: income, period: annual, data_variant: as-reported }
  - { key: financials-annual-balance, statement_kind: balance, period: annual, data_variant: as-reported }
  - { key: financials-annual-cashflow, statement_kind: cashflow, period: annual, data_variant: as-reported }
  - { key: financials-quarterly-income, statement_kind: income, period: quarterly, data_variant: as-reported }
  - { key: financials-quarterly-balance, statement_kind: balance, period: quarterly, data_variant: as-reported }
  - { key: financials-quarterly-cashflow, statement_kind: cashflow, period: quarterly, data_variant: as-reported }
  - { key: standardized-annual-income, statement_kind: income, period: annual, data_variant: standardized }
  - { key: standardized-annual-balance, statement_kind: balance, period: annual, data_variant: standardized }
  - { key: standardized-annual-cashflow, statement_kind: cashflow, period: annual, data_variant: standardized }
  - { key: standardized-quarterly-income, statement_kind: income, period: quarterly, data_variant: standardized }
  - { key: standardized-quarterly-balance, statement_kind: balance, period: quarterly, data_variant: standardized }
  - { key: standardized-quarterly-cashflow, statement_kind: cashflow, period: quarterly, data_variant: standardized }
max_iterations: 15
model:
  backend: anthropic
  model_id: claude-sonnet-4-5
  max_tokens: 8192
  params:
    api_key_env: ANTHROPIC_API_KEY
    timeout_ms: 300000
capabilities:
  browser:
    backend: remote_browser
    params:
      endpoint: http://127.0.0.1:3000
      base_url: https://stockanalysis.com
      username_env: STOCKANALYSIS_USERNAME
      password_env: STOCKANALYSIS_PASSWORD
      login_attempts: 2
      settle_ms: 2000
      timeout_ms: 90000
  vision:
    backend: gemini
    params:
      api_key_env: GEMINI_API_KEY
      model_id: gemini-2.5-flash
      timeout_ms: 60000
  search:
    backend: perplexity
    params:
      api_key_env: PERPLEXITY_API_KEY
      model_id: sonar-pro
      timeout_ms: 30000
storage:
  backend: http_object
  params:
    base_url_env: GAPFILL_STORAGE_URL
    auth_bearer_env: GAPFILL_STORAGE_KEY
    timeout_ms: 60000
callback:
  auth_bearer_env: GAPFILL_WEBHOOK_SECRET
  max_attempts: 2
  backoff_ms: 5000
  timeout_ms: 30000
"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub pipeline_name: String,
    pub pipeline_version: String,
    #[serde(default)]
    pub normalization_version: u32,
    pub documents: Vec<DocumentSpec>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    pub model: ModelBinding,
    #[serde(default)]
    pub capabilities: CapabilityBindings,
    #[serde(default)]
    pub storage: StorageBinding,
    #[serde(default)]
    pub callback: CallbackBinding,
}

impl PipelineConfig {
    #[must_use]
    pub fn document(&self, key: &DocumentKey) -> Option<&DocumentSpec> {
        self.documents.iter().find(|document| &document.key == key)
    }
}

/// One target spreadsheet and the data-source page that feeds it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentSpec {
    pub key: DocumentKey,
    pub statement_kind: StatementKind,
    pub period: PeriodKind,
    pub data_variant: DataVariant,
}

impl DocumentSpec {
    #[must_use]
    pub fn browse_target(&self) -> BrowseTarget {
        BrowseTarget {
            statement_kind: self.statement_kind,
            period: self.period,
            data_variant: self.data_variant,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelBinding {
    pub backend: String,
    pub model_id: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityBinding {
    pub backend: String,
    #[serde(default)]
    pub params: Value,
}

impl CapabilityBinding {
    #[must_use]
    pub fn static_backend() -> Self {
        Self {
            backend: "static".to_string(),
            params: Value::Object(Map::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityBindings {
    pub browser: CapabilityBinding,
    pub vision: CapabilityBinding,
    pub search: CapabilityBinding,
}

impl Default for CapabilityBindings {
    fn default() -> Self {
        Self {
            browser: CapabilityBinding::static_backend(),
            vision: CapabilityBinding::static_backend(),
            search: CapabilityBinding::static_backend(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageBinding {
    pub backend: String,
    #[serde(default)]
    pub params: Value,
}

impl Default for StorageBinding {
    fn default() -> Self {
        Self {
            backend: "local_dir".to_string(),
            params: Value::Object(Map::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackBinding {
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
    #[serde(default = "default_callback_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_callback_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_callback_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CallbackBinding {
    fn default() -> Self {
        Self {
            auth_bearer_env: None,
            max_attempts: default_callback_attempts(),
            backoff_ms: default_callback_backoff_ms(),
            timeout_ms: default_callback_timeout_ms(),
        }
    }
}

fn default_max_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_callback_attempts() -> u32 {
    2
}

fn default_callback_backoff_ms() -> u64 {
    5_000
}

fn default_callback_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineEnvelope {
    pub source_format: String,
    pub source_yaml_hash: String,
    pub normalized_hash: String,
    pub config: PipelineConfig,
    pub normalized_json: Value,
}

/// Load pipeline YAML from disk and normalize it into canonical internal form.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, validated, or normalized.
pub fn load_pipeline_from_path(path: &Path) -> Result<PipelineEnvelope> {
    let content = fs::read_to_string(path)
        .map_err(|err| anyhow!("failed to read pipeline {}: {err}", path.display()))?;
    normalize_pipeline_yaml(&content)
}

/// The built-in twelve-document pipeline.
///
/// # Errors
/// Returns an error only if the embedded YAML fails validation.
pub fn default_pipeline() -> Result<PipelineEnvelope> {
    normalize_pipeline_yaml(DEFAULT_PIPELINE_YAML)
}

/// Normalize pipeline YAML into deterministic canonical JSON + hash.
///
/// # Errors
/// Returns an error when YAML parsing, validation, or serialization fails.
pub fn normalize_pipeline_yaml(yaml: &str) -> Result<PipelineEnvelope> {
    let source_yaml_hash = hash_bytes(yaml.as_bytes());
    let mut config: PipelineConfig = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid pipeline YAML structure: {err}"))?;

    normalize_pipeline(&mut config);
    validate_pipeline(&config)?;

    let normalized_json = serde_json::to_value(&config)?;
    let normalized_hash = hash_json(&normalized_json)?;

    Ok(PipelineEnvelope {
        source_format: "yaml".to_string(),
        source_yaml_hash,
        normalized_hash,
        config,
        normalized_json,
    })
}

fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    ensure_non_empty("pipeline_name", &config.pipeline_name)?;
    ensure_non_empty("pipeline_version", &config.pipeline_version)?;

    if config.documents.is_empty() {
        return Err(anyhow!("documents MUST list at least one document"));
    }
    let mut keys = BTreeSet::new();
    for document in &config.documents {
        ensure_non_empty("documents[].key", document.key.as_str())?;
        if !keys.insert(document.key.clone()) {
            return Err(anyhow!("duplicate document key: {}", document.key));
        }
    }

    if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&config.max_iterations) {
        return Err(anyhow!(
            "max_iterations MUST be within {MIN_ITERATIONS}..={MAX_ITERATIONS}, got {}",
            config.max_iterations
        ));
    }

    ensure_non_empty("model.backend", &config.model.backend)?;
    ensure_non_empty("model.model_id", &config.model.model_id)?;
    if config.model.max_tokens == 0 {
        return Err(anyhow!("model.max_tokens MUST be positive"));
    }

    for (name, binding) in [
        ("browser", &config.capabilities.browser),
        ("vision", &config.capabilities.vision),
        ("search", &config.capabilities.search),
    ] {
        ensure_non_empty(&format!("capabilities.{name}.backend"), &binding.backend)?;
        if !binding.params.is_object() {
            return Err(anyhow!("capabilities.{name}.params MUST be a mapping"));
        }
    }

    ensure_non_empty("storage.backend", &config.storage.backend)?;
    if config.callback.max_attempts == 0 {
        return Err(anyhow!("callback.max_attempts MUST be at least 1"));
    }

    Ok(())
}

fn normalize_pipeline(config: &mut PipelineConfig) {
    config.normalization_version = NORMALIZATION_VERSION;
    config.pipeline_name = config.pipeline_name.trim().to_string();
    config.pipeline_version = config.pipeline_version.trim().to_string();

    // Document order is processing order and stays as written.
    for document in &mut config.documents {
        document.key = DocumentKey::new(document.key.as_str().trim());
    }

    config.model.backend = config.model.backend.trim().to_ascii_lowercase();
    config.model.model_id = config.model.model_id.trim().to_string();
    config.model.params = canonical_params(&config.model.params);

    for binding in [
        &mut config.capabilities.browser,
        &mut config.capabilities.vision,
        &mut config.capabilities.search,
    ] {
        binding.backend = binding.backend.trim().to_ascii_lowercase();
        binding.params = canonical_params(&binding.params);
    }

    config.storage.backend = config.storage.backend.trim().to_ascii_lowercase();
    config.storage.params = canonical_params(&config.storage.params);
}

/// Params with object keys in sorted order; `null` becomes an empty mapping.
fn canonical_params(value: &Value) -> Value {
    match value {
        Value::Null => Value::Object(Map::new()),
        other => canonical_value(other),
    }
}

fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                if let Some(inner) = map.get(key) {
                    sorted.insert(key.clone(), canonical_value(inner));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

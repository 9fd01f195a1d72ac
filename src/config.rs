//! TOML configuration.
//!
//! Every section except `[db]` and `[server]` is optional and falls back to
//! the defaults below. [`load_config`] validates ranges once so the rest of
//! the application can trust the values. [`Config::workflow`] turns the
//! file into the immutable [`WorkflowConfig`] handed to the orchestrator.

use anyhow::{bail, Context, Result};
use clause_matrix_core::fusion::FusionWeights;
use clause_matrix_core::models::RetrievalParams;
use clause_matrix_core::validation::{Relaxation, ValidationPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_k_step")]
    pub top_k_step: usize,
    #[serde(default = "default_threshold_factor")]
    pub threshold_factor: f64,
    /// Hits requested from each strategy before fusion.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_sparse_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_sparse_weight")]
    pub term_weight: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            score_threshold: default_score_threshold(),
            top_k: default_top_k(),
            top_k_step: default_top_k_step(),
            threshold_factor: default_threshold_factor(),
            candidate_k: default_candidate_k(),
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_sparse_weight(),
            term_weight: default_sparse_weight(),
        }
    }
}

fn default_score_threshold() -> f64 {
    0.3
}
fn default_top_k() -> usize {
    20
}
fn default_top_k_step() -> usize {
    10
}
fn default_threshold_factor() -> f64 {
    0.5
}
fn default_candidate_k() -> usize {
    40
}
fn default_semantic_weight() -> f64 {
    1.0
}
fn default_sparse_weight() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    #[serde(default = "default_min_retrieval_confidence")]
    pub min_retrieval_confidence: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_min_field_confidence")]
    pub min_field_confidence: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_success_rate: default_min_success_rate(),
            min_retrieval_confidence: default_min_retrieval_confidence(),
            max_retries: default_max_retries(),
            min_field_confidence: default_min_field_confidence(),
        }
    }
}

fn default_min_success_rate() -> f64 {
    0.30
}
fn default_min_retrieval_confidence() -> f64 {
    0.40
}
fn default_max_retries() -> u32 {
    3
}
fn default_min_field_confidence() -> f64 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_document_url_base")]
    pub document_url_base: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            call_timeout_secs: default_call_timeout_secs(),
            max_context_chars: default_max_context_chars(),
            document_url_base: default_document_url_base(),
        }
    }
}

fn default_concurrency() -> usize {
    8
}
fn default_call_timeout_secs() -> u64 {
    60
}
fn default_max_context_chars() -> usize {
    12_000
}
fn default_document_url_base() -> String {
    "https://docs.google.com/document/d".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowSection {
    #[serde(default = "default_workflow_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_workflow_timeout_secs(),
        }
    }
}

fn default_workflow_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_max_fields")]
    pub max_fields: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_prompt_chars: default_max_prompt_chars(),
            max_fields: default_max_fields(),
        }
    }
}

fn default_max_prompt_chars() -> usize {
    4_000
}
fn default_max_fields() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_provider_retries")]
    pub max_retries: u32,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            max_retries: default_provider_retries(),
            timeout_secs: default_provider_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl ModelConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_temperature() -> f64 {
    0.1
}
fn default_max_tokens() -> u32 {
    2_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_provider_retries")]
    pub max_retries: u32,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_provider_retries(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_provider_retries() -> u32 {
    5
}
fn default_provider_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Immutable knobs for one orchestrator, derived from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfig {
    pub initial_params: RetrievalParams,
    pub relaxation: Relaxation,
    pub weights: FusionWeights,
    pub candidate_k: usize,
    pub policy: ValidationPolicy,
    pub concurrency: usize,
    pub call_timeout: Duration,
    pub max_context_chars: usize,
    pub document_url_base: String,
    pub timeout: Duration,
    pub max_prompt_chars: usize,
    pub max_fields: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Config {
            db: DbConfig {
                path: PathBuf::from("./data/cmx.sqlite"),
            },
            retrieval: RetrievalConfig::default(),
            validation: ValidationConfig::default(),
            extraction: ExtractionConfig::default(),
            workflow: WorkflowSection::default(),
            query: QueryConfig::default(),
            model: ModelConfig::default(),
            embedding: EmbeddingConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:7341".to_string(),
            },
        }
        .workflow()
    }
}

impl Config {
    pub fn workflow(&self) -> WorkflowConfig {
        WorkflowConfig {
            initial_params: RetrievalParams {
                score_threshold: self.retrieval.score_threshold,
                top_k: self.retrieval.top_k,
            },
            relaxation: Relaxation {
                threshold_factor: self.retrieval.threshold_factor,
                top_k_step: self.retrieval.top_k_step,
            },
            weights: FusionWeights {
                semantic: self.retrieval.semantic_weight,
                keyword: self.retrieval.keyword_weight,
                term: self.retrieval.term_weight,
            },
            candidate_k: self.retrieval.candidate_k,
            policy: ValidationPolicy {
                min_success_rate: self.validation.min_success_rate,
                min_retrieval_confidence: self.validation.min_retrieval_confidence,
                max_retries: self.validation.max_retries,
                min_field_confidence: self.validation.min_field_confidence,
            },
            concurrency: self.extraction.concurrency,
            call_timeout: Duration::from_secs(self.extraction.call_timeout_secs),
            max_context_chars: self.extraction.max_context_chars,
            document_url_base: self.extraction.document_url_base.clone(),
            timeout: Duration::from_secs(self.workflow.timeout_secs),
            max_prompt_chars: self.query.max_prompt_chars,
            max_fields: self.query.max_fields,
        }
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        bail!("{} must be in [0.0, 1.0], got {}", name, value);
    }
    Ok(())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Retrieval
    check_unit("retrieval.score_threshold", config.retrieval.score_threshold)?;
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.top_k_step < 1 {
        bail!("retrieval.top_k_step must be >= 1");
    }
    if !(config.retrieval.threshold_factor > 0.0 && config.retrieval.threshold_factor < 1.0) {
        bail!("retrieval.threshold_factor must be in (0.0, 1.0)");
    }
    if config.retrieval.candidate_k < 1 {
        bail!("retrieval.candidate_k must be >= 1");
    }
    for (name, w) in [
        ("retrieval.semantic_weight", config.retrieval.semantic_weight),
        ("retrieval.keyword_weight", config.retrieval.keyword_weight),
        ("retrieval.term_weight", config.retrieval.term_weight),
    ] {
        if !w.is_finite() || w < 0.0 {
            bail!("{} must be a non-negative number", name);
        }
    }

    // Validation
    check_unit("validation.min_success_rate", config.validation.min_success_rate)?;
    check_unit(
        "validation.min_retrieval_confidence",
        config.validation.min_retrieval_confidence,
    )?;
    check_unit(
        "validation.min_field_confidence",
        config.validation.min_field_confidence,
    )?;

    // Extraction, workflow, query
    if config.extraction.concurrency < 1 {
        bail!("extraction.concurrency must be >= 1");
    }
    if config.extraction.call_timeout_secs == 0 {
        bail!("extraction.call_timeout_secs must be > 0");
    }
    if config.extraction.max_context_chars == 0 {
        bail!("extraction.max_context_chars must be > 0");
    }
    if config.workflow.timeout_secs == 0 {
        bail!("workflow.timeout_secs must be > 0");
    }
    if config.query.max_prompt_chars == 0 {
        bail!("query.max_prompt_chars must be > 0");
    }
    if config.query.max_fields == 0 {
        bail!("query.max_fields must be > 0");
    }

    // Providers
    match config.model.provider.as_str() {
        "disabled" | "anthropic" | "openai" => {}
        other => bail!(
            "Unknown model provider: '{}'. Must be disabled, anthropic, or openai.",
            other
        ),
    }
    if config.model.is_enabled() && config.model.model.is_none() {
        bail!(
            "model.model must be specified when provider is '{}'",
            config.model.provider
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    const MINIMAL: &str = r#"
[db]
path = "./data/cmx.sqlite"

[server]
bind = "127.0.0.1:7341"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(MINIMAL).unwrap();
        let wf = config.workflow();
        assert_eq!(wf.initial_params.score_threshold, 0.3);
        assert_eq!(wf.initial_params.top_k, 20);
        assert_eq!(wf.policy.max_retries, 3);
        assert_eq!(wf.concurrency, 8);
        assert_eq!(wf.timeout, Duration::from_secs(300));
        assert_eq!(wf.weights, FusionWeights::default());
        assert!(!config.model.is_enabled());
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn default_workflow_matches_minimal_file() {
        assert_eq!(WorkflowConfig::default(), parse(MINIMAL).unwrap().workflow());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let toml_str = format!("{}\n[retrieval]\nscore_threshold = 1.5\n", MINIMAL);
        let err = parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("retrieval.score_threshold"));
    }

    #[test]
    fn rejects_non_widening_relaxation() {
        let toml_str = format!("{}\n[retrieval]\nthreshold_factor = 1.0\n", MINIMAL);
        assert!(parse(&toml_str).is_err());
        let toml_str = format!("{}\n[retrieval]\ntop_k_step = 0\n", MINIMAL);
        assert!(parse(&toml_str).is_err());
    }

    #[test]
    fn enabled_providers_need_models() {
        let toml_str = format!("{}\n[model]\nprovider = \"anthropic\"\n", MINIMAL);
        assert!(parse(&toml_str).is_err());
        let toml_str = format!(
            "{}\n[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\n",
            MINIMAL
        );
        assert!(parse(&toml_str).unwrap_err().to_string().contains("dims"));
        let toml_str = format!("{}\n[model]\nprovider = \"gemini\"\nmodel = \"x\"\n", MINIMAL);
        assert!(parse(&toml_str).is_err());
    }
}

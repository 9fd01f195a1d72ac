//! Language-model providers implementing the core [`AnalysisModel`] capability.
//!
//! The workflow asks the model for exactly two things: a field plan for a
//! prompt and one structured extraction per (document, field). Both are
//! requested as JSON; [`extract_json`] tolerates fenced code blocks and
//! leading prose around the object.
//!
//! | Config Value | Endpoint |
//! |-------------|----------|
//! | `"anthropic"` | `POST {url}/v1/messages` (default `https://api.anthropic.com`) |
//! | `"openai"` | `POST {url}/v1/chat/completions` (default `https://api.openai.com`) |
//! | `"disabled"` | none; every call fails |

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use clause_matrix_core::capability::{AnalysisModel, ExtractionCall, ExtractionDraft};
use clause_matrix_core::error::CapabilityError;
use clause_matrix_core::models::{AnalysisType, FieldSpec, QueryPlan};

use crate::config::ModelConfig;
use crate::http;

const ANTHROPIC_VERSION: &str = "2023-06-01";

const PLAN_SYSTEM_PROMPT: &str = r#"You are a legal query analysis AI. For a contract analysis request:

1. Classify the intent (risk_analysis, clause_extraction, compliance_check, general_analysis)
2. Extract key legal terms and concepts
3. Generate expanded queries to improve retrieval
4. Choose 1 to 5 columns that extract ONLY what the user is asking for

Respond with JSON only, in this format:
{
    "intent": "clause_extraction",
    "legal_terms": ["termination", "notice period"],
    "expanded_queries": ["termination for convenience notice days"],
    "columns": [
        {
            "name": "Termination Notice Period",
            "instruction": "How much notice is required to terminate the agreement",
            "keywords": ["terminate", "notice", "days"]
        }
    ]
}"#;

const EXTRACT_SYSTEM_PROMPT: &str = r#"You are an expert legal document analyst. Extract one specific fact from the passages of a single document.

CRITICAL INSTRUCTIONS:
1. Use ONLY the passages provided. Never use outside knowledge.
2. Give a short, direct value. Do not copy whole paragraphs into the value.
3. "exact_quote" must be copied verbatim from one passage and support the value.
4. If the passages do not contain the information, set value to "Not found", exact_quote to "" and confidence to 0.
5. "confidence" is a number between 0 and 1.

Respond with JSON only:
{
    "value": "concise, specific answer",
    "exact_quote": "verbatim supporting text",
    "page_numbers": [3],
    "confidence": 0.9,
    "source": "section or clause reference"
}"#;

/// Wire dialect of an HTTP model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Anthropic,
    OpenAI,
}

/// Chat-completion backed [`AnalysisModel`].
pub struct HttpModel {
    client: reqwest::Client,
    dialect: Dialect,
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
    temperature: f64,
    max_tokens: u32,
}

impl HttpModel {
    pub fn new(config: &ModelConfig, dialect: Dialect) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("model.model required for {} provider", config.provider))?;
        let (key_var, default_url) = match dialect {
            Dialect::Anthropic => ("ANTHROPIC_API_KEY", "https://api.anthropic.com"),
            Dialect::OpenAI => ("OPENAI_API_KEY", "https://api.openai.com"),
        };
        let api_key = std::env::var(key_var)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", key_var))?;
        let url = config.url.clone().unwrap_or_else(|| default_url.to_string());

        Ok(Self {
            client: http::client(config.timeout_secs)?,
            dialect,
            model,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, CapabilityError> {
        match self.dialect {
            Dialect::Anthropic => {
                let body = serde_json::json!({
                    "model": self.model,
                    "max_tokens": self.max_tokens,
                    "temperature": self.temperature,
                    "system": system,
                    "messages": [{ "role": "user", "content": user }],
                });
                let json = http::post_json(
                    &self.client,
                    &format!("{}/v1/messages", self.url),
                    &[
                        ("x-api-key", self.api_key.clone()),
                        ("anthropic-version", ANTHROPIC_VERSION.to_string()),
                    ],
                    &body,
                    self.max_retries,
                    "Anthropic",
                )
                .await?;
                anthropic_text(&json)
            }
            Dialect::OpenAI => {
                let body = serde_json::json!({
                    "model": self.model,
                    "max_tokens": self.max_tokens,
                    "temperature": self.temperature,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user },
                    ],
                });
                let json = http::post_json(
                    &self.client,
                    &format!("{}/v1/chat/completions", self.url),
                    &[("Authorization", format!("Bearer {}", self.api_key))],
                    &body,
                    self.max_retries,
                    "OpenAI",
                )
                .await?;
                openai_text(&json)
            }
        }
    }
}

fn anthropic_text(json: &serde_json::Value) -> Result<String, CapabilityError> {
    json.get("content")
        .and_then(|c| c.as_array())
        .and_then(|blocks| {
            blocks
                .iter()
                .find_map(|b| b.get("text").and_then(|t| t.as_str()))
        })
        .map(str::to_string)
        .ok_or_else(|| CapabilityError::Malformed("Anthropic response: no text content".into()))
}

fn openai_text(json: &serde_json::Value) -> Result<String, CapabilityError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| CapabilityError::Malformed("OpenAI response: no message content".into()))
}

#[async_trait]
impl AnalysisModel for HttpModel {
    async fn plan_fields(
        &self,
        prompt: &str,
        analysis_type: AnalysisType,
    ) -> Result<QueryPlan, CapabilityError> {
        let user = format!(
            "Analyze this contract analysis query ({} analysis):\n\nQuery: \"{}\"\n\n\
             Provide intent, legal terms, expanded queries, and the columns to extract.",
            analysis_type, prompt
        );
        let text = self.complete(PLAN_SYSTEM_PROMPT, &user).await?;
        parse_plan(&text)
    }

    async fn extract_field(&self, call: &ExtractionCall) -> Result<ExtractionDraft, CapabilityError> {
        let text = self
            .complete(EXTRACT_SYSTEM_PROMPT, &extraction_prompt(call))
            .await?;
        parse_draft(&text)
    }
}

/// User message for one extraction call.
pub fn extraction_prompt(call: &ExtractionCall) -> String {
    let mut out = format!(
        "DOCUMENT: {}\nREQUEST: {}\nCOLUMN: {}\nWHAT TO EXTRACT: {}\n\nPASSAGES:\n",
        call.document_name, call.prompt, call.field.name, call.field.instruction
    );
    for passage in &call.passages {
        if passage.page_numbers.is_empty() {
            out.push_str(&format!("\n[{}]\n{}\n", passage.chunk_id, passage.text));
        } else {
            let pages: Vec<String> = passage.page_numbers.iter().map(u32::to_string).collect();
            out.push_str(&format!(
                "\n[{}] (pages {})\n{}\n",
                passage.chunk_id,
                pages.join(", "),
                passage.text
            ));
        }
    }
    out
}

/// The JSON object inside a model reply.
///
/// Accepts a bare object, a ```json fenced block, or an object embedded in
/// prose (first `{` to last `}`).
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    (end > start).then(|| &unfenced[start..=end])
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ColumnReply {
    Name(String),
    Spec {
        name: String,
        #[serde(default)]
        instruction: String,
        #[serde(default)]
        keywords: Vec<String>,
    },
}

#[derive(Deserialize)]
struct PlanReply {
    #[serde(default)]
    intent: String,
    #[serde(default)]
    legal_terms: Vec<String>,
    #[serde(default)]
    expanded_queries: Vec<String>,
    #[serde(default)]
    columns: Vec<ColumnReply>,
}

pub fn parse_plan(text: &str) -> Result<QueryPlan, CapabilityError> {
    let json = extract_json(text)
        .ok_or_else(|| CapabilityError::Malformed("plan reply contains no JSON object".into()))?;
    let reply: PlanReply = serde_json::from_str(json)
        .map_err(|e| CapabilityError::Malformed(format!("plan reply: {}", e)))?;

    let fields = reply
        .columns
        .into_iter()
        .map(|c| match c {
            ColumnReply::Name(name) => FieldSpec {
                name,
                instruction: String::new(),
                keywords: Vec::new(),
            },
            ColumnReply::Spec {
                name,
                instruction,
                keywords,
            } => FieldSpec {
                name,
                instruction,
                keywords,
            },
        })
        .collect();

    Ok(QueryPlan {
        intent: reply.intent,
        legal_terms: reply.legal_terms,
        expanded_queries: reply.expanded_queries,
        fields,
    })
}

pub fn parse_draft(text: &str) -> Result<ExtractionDraft, CapabilityError> {
    let json = extract_json(text).ok_or_else(|| {
        CapabilityError::Malformed("extraction reply contains no JSON object".into())
    })?;
    serde_json::from_str(json)
        .map_err(|e| CapabilityError::Malformed(format!("extraction reply: {}", e)))
}

pub struct DisabledModel;

#[async_trait]
impl AnalysisModel for DisabledModel {
    async fn plan_fields(
        &self,
        _prompt: &str,
        _analysis_type: AnalysisType,
    ) -> Result<QueryPlan, CapabilityError> {
        Err(CapabilityError::Disabled(
            "model provider is disabled; set [model] provider".to_string(),
        ))
    }

    async fn extract_field(&self, _call: &ExtractionCall) -> Result<ExtractionDraft, CapabilityError> {
        Err(CapabilityError::Disabled(
            "model provider is disabled; set [model] provider".to_string(),
        ))
    }
}

/// Create the configured [`AnalysisModel`].
pub fn create_model(config: &ModelConfig) -> Result<Arc<dyn AnalysisModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "anthropic" => Ok(Arc::new(HttpModel::new(config, Dialect::Anthropic)?)),
        "openai" => Ok(Arc::new(HttpModel::new(config, Dialect::OpenAI)?)),
        other => bail!("Unknown model provider: {}", other),
    }
}

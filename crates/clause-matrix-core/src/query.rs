//! Query processing helpers: prompt validation, field-spec normalization,
//! and the literal term lists used by the sparse retrieval strategies.

use crate::error::AnalysisError;
use crate::models::{AnalysisType, FieldSpec, KeywordTerm, QueryPlan};

/// Expanded queries kept from a plan and searched semantically.
pub const MAX_EXPANDED_QUERIES: usize = 3;

/// Words that never make useful keyword terms.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "any", "are", "as", "at", "be", "by", "each", "extract", "find", "for",
    "from", "get", "has", "have", "identify", "in", "is", "it", "its", "list", "of", "on", "or",
    "show", "that", "the", "their", "them", "there", "these", "this", "to", "was", "what",
    "when", "where", "which", "who", "with",
];

/// Legal synonym expansions applied to keyword terms.
const LEGAL_EXPANSIONS: &[(&str, &[&str])] = &[
    ("termination", &["terminate", "end", "conclusion"]),
    ("payment", &["pay", "compensation", "remuneration"]),
    ("liability", &["responsible", "liable", "obligation"]),
    ("breach", &["violation", "default", "non-compliance"]),
    ("notice", &["notification", "inform", "advise"]),
    ("confidential", &["proprietary", "secret", "non-disclosure"]),
];

/// Trim and validate a prompt.
///
/// Fails with [`AnalysisError::InvalidRequest`] when the prompt is blank or
/// longer than `max_chars` characters.
pub fn validate_prompt(prompt: &str, max_chars: usize) -> Result<&str, AnalysisError> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(AnalysisError::invalid_request("prompt must not be empty"));
    }
    let len = trimmed.chars().count();
    if len > max_chars {
        return Err(AnalysisError::invalid_request(format!(
            "prompt is {} characters; the maximum is {}",
            len, max_chars
        )));
    }
    Ok(trimmed)
}

/// Prompt as handed to the planner, prefixed for specialized analyses.
pub fn framed_prompt(prompt: &str, analysis_type: AnalysisType) -> String {
    match analysis_type.prompt_prefix() {
        Some(prefix) => format!("{} {}", prefix, prompt),
        None => prompt.to_string(),
    }
}

/// Clean up a planner result into the field list used by the workflow.
///
/// - trims names and drops empty ones
/// - drops case-insensitive duplicate names, keeping the first
/// - fills a missing instruction from the field name and prompt
/// - appends the plan's legal terms to every field's keywords (deduplicated)
/// - truncates to `max_fields`
/// - deduplicates expanded queries and keeps the first [`MAX_EXPANDED_QUERIES`]
///
/// Fails with [`AnalysisError::NoFieldsDerived`] when nothing survives.
pub fn normalize_plan(
    mut plan: QueryPlan,
    prompt: &str,
    max_fields: usize,
) -> Result<QueryPlan, AnalysisError> {
    let legal_terms = dedup_terms(plan.legal_terms.iter().map(String::as_str));
    let mut fields: Vec<FieldSpec> = Vec::new();

    for field in plan.fields.drain(..) {
        let name = field.name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        if fields.iter().any(|f| f.name.eq_ignore_ascii_case(&name)) {
            continue;
        }
        let instruction = match field.instruction.trim() {
            "" => format!("{}: {}", name, prompt),
            s => s.to_string(),
        };
        let keywords = dedup_terms(
            field
                .keywords
                .iter()
                .map(String::as_str)
                .chain(legal_terms.iter().map(String::as_str)),
        );
        fields.push(FieldSpec {
            name,
            instruction,
            keywords,
        });
        if fields.len() == max_fields {
            break;
        }
    }

    if fields.is_empty() {
        return Err(AnalysisError::NoFieldsDerived {
            reason: "the planner returned no usable field names".to_string(),
        });
    }

    plan.fields = fields;
    plan.legal_terms = legal_terms;
    plan.expanded_queries = dedup_terms(plan.expanded_queries.iter().map(String::as_str));
    plan.expanded_queries.truncate(MAX_EXPANDED_QUERIES);
    if plan.intent.trim().is_empty() {
        plan.intent = "general_analysis".to_string();
    }
    Ok(plan)
}

fn dedup_terms<'a>(terms: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for t in terms {
        let t = t.trim();
        if t.is_empty() {
            continue;
        }
        if !out.iter().any(|o| o.eq_ignore_ascii_case(t)) {
            out.push(t.to_string());
        }
    }
    out
}

/// Literal words of an instruction, lowercased, without stopwords or
/// punctuation, in first-seen order.
pub fn instruction_terms(instruction: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in instruction.split(|c: char| !c.is_alphanumeric() && c != '-' && c != '\'') {
        let word = raw.trim_matches(|c: char| c == '-' || c == '\'').to_lowercase();
        if word.chars().count() < 3 || STOPWORDS.contains(&word.as_str()) {
            continue;
        }
        if !terms.contains(&word) {
            terms.push(word);
        }
    }
    terms
}

/// Attach legal synonyms to each term that has an entry in the expansion
/// table. Term order is kept; a synonym equal to the term is skipped.
pub fn expand_terms(terms: &[String]) -> Vec<KeywordTerm> {
    terms
        .iter()
        .map(|term| {
            let mut expanded = KeywordTerm::literal(term.clone());
            for (key, synonyms) in LEGAL_EXPANSIONS {
                if !term.contains(key) {
                    continue;
                }
                for synonym in *synonyms {
                    if *synonym != term.as_str() && !expanded.synonyms.iter().any(|s| s == synonym) {
                        expanded.synonyms.push((*synonym).to_string());
                    }
                }
            }
            expanded
        })
        .collect()
}

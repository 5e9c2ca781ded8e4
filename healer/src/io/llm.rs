//! Language-model adapter for the classifier fallback and model-assisted
//! patches.
//!
//! [`ModelClient`] is the seam: production uses [`OpenAiCompatClient`]
//! (an OpenAI-compatible `/chat/completions` endpoint, deterministic
//! sampling), tests use scripted clients. Callers go through
//! [`classify_residual`] and [`propose_patch`], which degrade every model
//! failure to "no finding" rather than propagating it.

use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::validator_for;
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::patch::{SearchReplace, parse_search_replace};
use crate::core::types::{BugRecord, Category};
use crate::io::config::ModelConfig;
use crate::io::retry::{RetryPolicy, Sleeper, ThreadSleeper};

const CLASSIFIER_TEMPLATE: &str = include_str!("prompts/classifier.md");
const PATCH_TEMPLATE: &str = include_str!("prompts/patch.md");
const PATCH_SYSTEM: &str = concat!(
    "You are a precise code fixer. ",
    "Return only SEARCH and REPLACE blocks. No markdown. No explanations."
);

/// Error bodies are clipped to this many characters in errors and logs.
const ERROR_BODY_LIMIT: usize = 500;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("model API returned HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
    },
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("malformed model response: {0}")]
    Malformed(String),
}

impl ModelError {
    /// Rate limits, server errors, and transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Http { status, .. } => *status == 429 || *status >= 500,
            ModelError::Transport(_) => true,
            ModelError::Malformed(_) => false,
        }
    }
}

/// A chat-completion backend.
pub trait ModelClient {
    /// Send one system + user exchange and return the reply text.
    fn complete(&self, system: &str, user: &str) -> Result<String, ModelError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f64,
    top_p: f64,
    messages: Vec<ChatMessage<'a>>,
}

/// Client for OpenAI-compatible chat completion APIs.
pub struct OpenAiCompatClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f64,
    top_p: f64,
    retry: RetryPolicy,
    sleeper: Box<dyn Sleeper>,
}

impl OpenAiCompatClient {
    pub fn new(cfg: &ModelConfig, api_key: String) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("build model http client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            model: cfg.model.clone(),
            api_key,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            retry: RetryPolicy::new(
                cfg.max_retries,
                Duration::from_secs(2),
                Duration::from_secs(16),
            ),
            sleeper: Box::new(ThreadSleeper),
        })
    }

    fn send_once(&self, system: &str, user: &str) -> Result<String, ModelError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            top_p: self.top_p,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|err| ModelError::Transport(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(ModelError::Http {
                status: status.as_u16(),
                body: clip(&text, ERROR_BODY_LIMIT),
            });
        }
        let value: Value = resp
            .json()
            .map_err(|err| ModelError::Malformed(format!("response body is not json: {err}")))?;
        extract_content(&value)
    }
}

impl ModelClient for OpenAiCompatClient {
    #[instrument(skip_all, fields(model = %self.model))]
    fn complete(&self, system: &str, user: &str) -> Result<String, ModelError> {
        let content = self.retry.run(
            self.sleeper.as_ref(),
            |_| self.send_once(system, user),
            ModelError::is_retryable,
        )?;
        info!(chars = content.len(), "model replied");
        Ok(content)
    }
}

/// Pull `choices[0].message.content` out of a chat completion response.
pub fn extract_content(response: &Value) -> Result<String, ModelError> {
    response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ModelError::Malformed("missing choices[0].message.content".to_string()))
}

fn clip(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Remove a surrounding ``` / ```json fence if the model added one anyway.
pub fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.strip_suffix('\n').unwrap_or(rest).trim()
}

fn findings_schema() -> Value {
    json!({
        "type": "object",
        "required": ["file", "line", "bug_type", "message"],
        "properties": {
            "file": { "type": "string", "minLength": 1 },
            "line": { "type": "integer", "minimum": 0 },
            "bug_type": { "type": "string" },
            "message": { "type": "string" }
        }
    })
}

/// Parse a classifier reply into bug records. Items that fail the schema or
/// name an unknown category are dropped.
pub fn parse_findings(content: &str) -> Result<Vec<BugRecord>, ModelError> {
    let value: Value = serde_json::from_str(strip_fences(content))
        .map_err(|err| ModelError::Malformed(format!("findings are not json: {err}")))?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    let validator = validator_for(&findings_schema())
        .map_err(|err| ModelError::Malformed(format!("invalid findings schema: {err}")))?;

    let mut bugs = Vec::new();
    for item in &items {
        if !validator.is_valid(item) {
            let errors: Vec<String> = validator.iter_errors(item).map(|e| e.to_string()).collect();
            debug!(?errors, "dropping finding that fails schema");
            continue;
        }
        let Some(category) = item["bug_type"].as_str().and_then(Category::parse) else {
            debug!(bug_type = %item["bug_type"], "dropping finding with unknown category");
            continue;
        };
        let line = item["line"].as_u64().unwrap_or(0).min(u64::from(u32::MAX)) as u32;
        bugs.push(BugRecord::new(
            item["file"].as_str().unwrap_or("unknown"),
            line,
            category,
            item["message"].as_str().unwrap_or(""),
        ));
    }
    Ok(bugs)
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("classifier", CLASSIFIER_TEMPLATE)
            .expect("classifier template should be valid");
        env.add_template("patch", PATCH_TEMPLATE)
            .expect("patch template should be valid");
        Self { env }
    }

    fn render_classifier(&self) -> Result<String> {
        let categories: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
        let rendered = self
            .env
            .get_template("classifier")?
            .render(context! { categories => categories })?;
        Ok(rendered)
    }

    fn render_patch(&self, input: &PatchPrompt<'_>) -> Result<String> {
        let rendered = self.env.get_template("patch")?.render(context! {
            file_name => input.file_name,
            category => input.category.as_str(),
            message => input.message,
            fix_hint => (!input.fix_hint.trim().is_empty()).then_some(input.fix_hint),
            start_line => input.start_line,
            end_line => input.end_line,
            snippet => input.snippet,
        })?;
        Ok(rendered)
    }
}

/// Ask the model to classify residual log lines and source blocks.
///
/// Never fails: an empty residual, a transport error, or an unparseable
/// reply all yield no findings.
#[instrument(skip_all, fields(lines = residual.len()))]
pub fn classify_residual(client: &dyn ModelClient, residual: &[String]) -> Vec<BugRecord> {
    if residual.is_empty() {
        return Vec::new();
    }
    let system = match PromptEngine::new().render_classifier() {
        Ok(system) => system,
        Err(err) => {
            let chain = format!("{err:#}");
            warn!(err = %chain, "render classifier prompt");
            return Vec::new();
        }
    };
    let reply = match client.complete(&system, &residual.join("\n")) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(err = %err, "model classification unavailable");
            return Vec::new();
        }
    };
    match parse_findings(&reply) {
        Ok(bugs) => {
            info!(findings = bugs.len(), "model classification finished");
            bugs
        }
        Err(err) => {
            warn!(err = %err, "discarding model classification");
            Vec::new()
        }
    }
}

/// Inputs for a model-assisted patch.
#[derive(Debug, Clone)]
pub struct PatchPrompt<'a> {
    pub file_name: &'a str,
    pub category: Category,
    pub message: &'a str,
    pub fix_hint: &'a str,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub snippet: &'a str,
}

/// Ask the model for a search/replace block. `None` on any failure.
#[instrument(skip_all, fields(file = input.file_name))]
pub fn propose_patch(client: &dyn ModelClient, input: &PatchPrompt<'_>) -> Option<SearchReplace> {
    let prompt = match PromptEngine::new().render_patch(input) {
        Ok(prompt) => prompt,
        Err(err) => {
            let chain = format!("{err:#}");
            warn!(err = %chain, "render patch prompt");
            return None;
        }
    };
    let reply = match client.complete(PATCH_SYSTEM, &prompt) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(err = %err, "model patch unavailable");
            return None;
        }
    };
    let block = parse_search_replace(&reply);
    if block.is_none() {
        warn!("model reply has no search/replace block");
    }
    block
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct CannedClient {
        reply: Result<String, ModelError>,
        seen: RefCell<Vec<(String, String)>>,
    }

    impl CannedClient {
        fn new(reply: Result<String, ModelError>) -> Self {
            Self {
                reply,
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl ModelClient for CannedClient {
        fn complete(&self, system: &str, user: &str) -> Result<String, ModelError> {
            self.seen
                .borrow_mut()
                .push((system.to_string(), user.to_string()));
            self.reply.clone()
        }
    }

    #[test]
    fn parses_fenced_array_and_filters_unknown_categories() {
        let reply = concat!(
            "```json\n",
            r#"[{"file":"src/a.py","line":3,"bug_type":"logic","message":"wrong operator"},"#,
            r#"{"file":"src/b.py","line":1,"bug_type":"STYLE","message":"x"}]"#,
            "\n```"
        );
        let bugs = parse_findings(reply).expect("parse");
        let expected = BugRecord::new("src/a.py", 3, Category::Logic, "wrong operator");
        assert_eq!(bugs, [expected]);
    }

    #[test]
    fn single_object_is_accepted_and_bad_items_dropped() {
        let single = r#"{"file":"a.js","line":2,"bug_type":"TYPE_ERROR","message":"m"}"#;
        let bugs = parse_findings(single).expect("parse");
        assert_eq!(bugs.len(), 1);
        let bad_line = r#"[{"file":"a.js","line":"two","bug_type":"SYNTAX","message":"m"}]"#;
        let bugs = parse_findings(bad_line).expect("parse");
        assert!(bugs.is_empty());
    }

    #[test]
    fn non_json_reply_is_malformed() {
        let err = parse_findings("I found no bugs").expect_err("malformed");
        assert!(matches!(err, ModelError::Malformed(_)));
    }

    #[test]
    fn classify_residual_degrades_on_errors() {
        let client = CannedClient::new(Err(ModelError::Http {
            status: 429,
            body: "slow down".into(),
        }));
        assert!(classify_residual(&client, &["boom".to_string()]).is_empty());
        assert!(classify_residual(&client, &[]).is_empty());
        assert_eq!(client.seen.borrow().len(), 1);
    }

    #[test]
    fn classifier_prompt_lists_categories() {
        let client = CannedClient::new(Ok("[]".into()));
        classify_residual(&client, &["line one".to_string(), "line two".to_string()]);
        let seen = client.seen.borrow();
        let categories = "SYNTAX, LOGIC, TYPE_ERROR, IMPORT, INDENTATION, LINTING";
        assert!(seen[0].0.contains(categories));
        assert_eq!(seen[0].1, "line one\nline two");
    }

    #[test]
    fn propose_patch_parses_block() {
        let client = CannedClient::new(Ok("<<<<\ndef f()\n====\ndef f():\n>>>>".into()));
        let block = propose_patch(
            &client,
            &PatchPrompt {
                file_name: "calc.py",
                category: Category::Syntax,
                message: "SyntaxError: expected ':'",
                fix_hint: "",
                start_line: 1,
                end_line: 3,
                snippet: "   1 | def f()",
            },
        )
        .expect("block");
        assert_eq!(block.replace, ["def f():"]);
        let seen = client.seen.borrow();
        assert!(seen[0].1.contains("Original code (lines 1 to 3):"));
        assert!(!seen[0].1.contains("Fix hint"));
    }

    #[test]
    fn retryable_classification() {
        let http = |status| ModelError::Http {
            status,
            body: String::new(),
        };
        assert!(http(503).is_retryable());
        assert!(!http(401).is_retryable());
        assert!(!ModelError::Malformed("x".into()).is_retryable());
    }

    #[test]
    fn strips_plain_fence() {
        assert_eq!(strip_fences("```\n[]\n```"), "[]");
        assert_eq!(strip_fences("  []  "), "[]");
    }
}

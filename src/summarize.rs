//! Natural-language change summaries.
//!
//! - **[`ChatSummarizer`]** calls an OpenAI-compatible `/chat/completions`
//!   endpoint (OpenAI or OpenRouter) with retry and backoff.
//! - **[`DisabledSummarizer`]** fails every request; used when
//!   `summarizer.provider = "disabled"`.
//!
//! Prompts are plain-text templates with `{placeholder}` substitution, see
//! [`render_prompt`].
//!
//! # Retry strategy
//!
//! - HTTP 429 or 5xx → retry with exponential backoff (1s, 2s, 4s, ...)
//! - other HTTP 4xx → fail immediately
//! - network error → retry
//!
//! An empty completion counts as a failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::SummarizerConfig;
use crate::error::{MonitorError, Result};

const SYSTEM_MESSAGE: &str = "You are an expert legal analyst who compares versions of terms of \
service, privacy policies and similar documents. Identify and explain the changes that matter \
to the people bound by them.";

/// Template used when neither a per-document nor a default prompt is
/// stored.
pub const BUILTIN_TEMPLATE: &str = "\
Compare two versions of the legal document \"{document_name}\" and summarize what changed.

Focus on:
1. New, removed or modified terms, policies and obligations
2. How the changes affect users' rights, responsibilities and data
3. Changes to liability, dispute resolution, data handling and jurisdiction

Ignore formatting changes, rewording that keeps the meaning, and updated dates or version numbers.

Previous version ({previous_timestamp}):
{previous_content}

Current version ({current_timestamp}):
{current_content}

Answer with:
- Summary: a short overview
- Key changes: a bulleted list
- User impact: what this means for users
- Recommendations: anything users should do

Be objective and concise. If nothing substantive changed, say so.";

/// Values substituted into a prompt template.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub document_name: &'a str,
    pub document_id: &'a str,
    pub previous_timestamp: &'a str,
    pub current_timestamp: &'a str,
    pub previous_content: &'a str,
    pub current_content: &'a str,
    /// Pre-rendered `key: value` lines about the pair.
    pub metadata: &'a str,
}

impl PromptContext<'_> {
    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "document_name" => Some(self.document_name),
            "document_id" => Some(self.document_id),
            "previous_timestamp" => Some(self.previous_timestamp),
            "current_timestamp" => Some(self.current_timestamp),
            "previous_content" => Some(self.previous_content),
            "current_content" => Some(self.current_content),
            "metadata" => Some(self.metadata),
            _ => None,
        }
    }
}

/// Substitute `{placeholder}`s in a single pass. Unknown placeholders and
/// stray braces are left as written, and substituted values are never
/// re-scanned.
pub fn render_prompt(template: &str, ctx: &PromptContext<'_>) -> String {
    let mut out = String::with_capacity(
        template.len() + ctx.previous_content.len() + ctx.current_content.len(),
    );
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => match ctx.lookup(&after[..close]) {
                Some(value) => {
                    out.push_str(value);
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            },
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &str) -> Result<String>;

    /// Recorded in diff metadata.
    fn model_name(&self) -> &str;

    /// `false` when the summarizer never answers, which health reports
    /// show as disabled rather than failing.
    fn is_enabled(&self) -> bool {
        true
    }

    /// One cheap round trip to the backend.
    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    async fn summarize(&self, _prompt: &str) -> Result<String> {
        Err(MonitorError::Summarization(
            "summarizer is disabled (set [summarizer].provider in the config)".to_string(),
        ))
    }

    fn model_name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

pub struct ChatSummarizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    provider: String,
    max_tokens: u32,
    temperature: f32,
    max_retries: u32,
}

impl ChatSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            MonitorError::Config("summarizer.model required".to_string())
        })?;
        let key_var = config.api_key_env();
        let api_key = std::env::var(key_var)
            .map_err(|_| MonitorError::Config(format!("{} not set", key_var)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MonitorError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url().trim_end_matches('/')),
            api_key,
            model,
            provider: config.provider.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }

    fn post(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let req = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body);
        if self.provider == "openrouter" {
            req.header("X-Title", "tos-monitor")
        } else {
            req
        }
    }
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    async fn summarize(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_MESSAGE},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": false,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.post(&body).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            MonitorError::Summarization(format!("invalid response body: {}", e))
                        })?;
                        let text = parse_chat_response(&json)?;
                        debug!(model = %self.model, chars = text.len(), "completion received");
                        return Ok(text);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = MonitorError::Summarization(format!(
                        "{} API error {}: {}",
                        self.provider,
                        status,
                        body_text.chars().take(300).collect::<String>()
                    ));
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(MonitorError::Summarization(format!(
                        "{} request failed: {}",
                        self.provider, e
                    )));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            MonitorError::Summarization("summarization failed after retries".to_string())
        }))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    /// A single five-token completion, without retries.
    async fn check(&self) -> Result<()> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": "Reply with OK."}],
            "max_tokens": 5,
            "stream": false,
        });
        let response = self.post(&body).send().await.map_err(|e| {
            MonitorError::Summarization(format!("{} unreachable: {}", self.provider, e))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::Summarization(format!(
                "{} API error {}",
                self.provider, status
            )));
        }
        Ok(())
    }
}

/// Extract `choices[0].message.content`, rejecting empty completions.
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::trim)
        .unwrap_or("");
    if content.is_empty() {
        return Err(MonitorError::Summarization(
            "model returned an empty completion".to_string(),
        ));
    }
    Ok(content.to_string())
}

/// Build the summarizer selected by `[summarizer].provider`.
pub fn create_summarizer(config: &SummarizerConfig) -> Result<Arc<dyn Summarizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledSummarizer)),
        "openai" | "openrouter" => Ok(Arc::new(ChatSummarizer::new(config)?)),
        other => Err(MonitorError::Config(format!(
            "unknown summarizer provider: '{}'",
            other
        ))),
    }
}

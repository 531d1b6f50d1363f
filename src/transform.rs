//! Text-transform collaborator.
//!
//! Sends the raw producer text through a chat completion (OpenAI or
//! Anthropic, selected by [`Provider`]) and returns the rewritten body plus
//! an optionally extracted date. Replies follow the `date//body` convention: everything before the first `//` is
//! the date tag (possibly wrapped in `{{ }}`), the rest is the body. When a
//! marker is configured the body is trimmed to start at its first occurrence.
//!
//! Treated as an opaque, possibly slow, possibly failing call: errors become
//! [`RelayError::Transform`] and the caller falls back to the raw text.

use serde_json::{json, Value};

use crate::error::{RelayError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 4096;

/// Outcome of a successful transform.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub text: String,
    pub date: Option<String>,
}

/// Which chat-completion backend the transformer talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
}

#[derive(Clone)]
pub struct TextTransformer {
    http: reqwest::Client,
    provider: Provider,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    marker: Option<String>,
}

impl TextTransformer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            provider: Provider::OpenAi,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            system_prompt: system_prompt.into(),
            marker: None,
        }
    }

    /// Trim transformed bodies to start at `marker` when present.
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    pub async fn transform(&self, text: &str) -> Result<Transformed> {
        let content = match self.provider {
            Provider::OpenAi => self.complete_openai(text).await?,
            Provider::Anthropic => self.complete_anthropic(text).await?,
        };
        Ok(parse_reply(&content, self.marker.as_deref()))
    }

    async fn complete_openai(&self, text: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": self.system_prompt},
                    {"role": "user", "content": text},
                ],
                "temperature": 0.7,
            }))
            .send()
            .await?;

        let body = checked_json(response).await?;
        extract_content(&body, "/choices/0/message/content")
    }

    async fn complete_anthropic(&self, text: &str) -> Result<String> {
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": self.model,
                "max_tokens": ANTHROPIC_MAX_TOKENS,
                "temperature": 0.7,
                "system": self.system_prompt,
                "messages": [
                    {"role": "user", "content": text},
                ],
            }))
            .send()
            .await?;

        let body = checked_json(response).await?;
        extract_content(&body, "/content/0/text")
    }
}

async fn checked_json(response: reqwest::Response) -> Result<Value> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(RelayError::Transform(format!(
            "completion failed ({status}): {body}"
        )));
    }
    Ok(response.json().await?)
}

fn extract_content(body: &Value, pointer: &str) -> Result<String> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            RelayError::Transform("completion response missing message content".to_string())
        })
}

fn parse_reply(raw: &str, marker: Option<&str>) -> Transformed {
    let (date, body) = match raw.split_once("//") {
        Some((date, body)) => {
            let date = date.replace("{{", "").replace("}}", "").trim().to_string();
            (Some(date).filter(|d| !d.is_empty()), body)
        }
        None => (None, raw),
    };
    let body = match marker.and_then(|m| body.find(m)) {
        Some(index) => &body[index..],
        None => body,
    };
    Transformed {
        text: body.trim().to_string(),
        date,
    }
}

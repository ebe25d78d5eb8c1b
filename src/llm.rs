use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AnalyzerError;

pub const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Longest slice of an upstream error body carried into our own errors.
const ERROR_BODY_LIMIT: usize = 512;

/// A chat-style completion backend. One call, one answer; conversation
/// history is the caller's concern.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, AnalyzerError>;
}

// ── OpenAI client ─────────────────────────────────────────────────────

pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(
        api_key: String,
        model: String,
        base_url: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build OpenAI HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_OPENAI_API_URL.to_string()),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, AnalyzerError> {
        let request = ChatRequest {
            model: &self.model,
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
            temperature: 0.2,
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AnalyzerError::UpstreamFailure(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyzerError::UpstreamFailure(format!(
                "OpenAI returned {}: {}",
                status,
                truncate(&body, ERROR_BODY_LIMIT)
            )));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            AnalyzerError::UpstreamFailure(format!("OpenAI response was not valid JSON: {}", e))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| {
                AnalyzerError::UpstreamFailure("OpenAI returned no completion content".to_string())
            })
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ── Test doubles ──────────────────────────────────────────────────────

/// Always answers with a fixed reply and records the prompts it was given.
pub struct ScriptedModel {
    reply: String,
    seen: std::sync::Mutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            seen: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// (system, user) pairs from every `complete` call so far.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String, AnalyzerError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((system.to_string(), user.to_string()));
        }
        Ok(self.reply.clone())
    }
}

/// Always fails the way an unreachable or misconfigured backend would.
pub struct UnreachableModel;

#[async_trait]
impl LanguageModel for UnreachableModel {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, AnalyzerError> {
        Err(AnalyzerError::UpstreamFailure(
            "OpenAI request failed: connection refused".to_string(),
        ))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

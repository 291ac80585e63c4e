// =============================================================================
// Chat client — HTTP transport for chat-completion endpoints
// =============================================================================
//
// Every supported provider speaks the same wire shape:
//   POST {base_url}/chat/completions
//   { "model", "messages": [{"role", "content"}], "max_tokens", "temperature" }
//   -> { "choices": [ { "message": { "content" } } ], "usage"? }
//
// Providers differ only in base URL and credentials; the manager owns both.
// The trait exists so the test suite can substitute scripted transports.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::llm::provider::classify_failure;
use crate::llm::LlmError;

/// Hard deadline for a single completion request.
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Completion result: the text plus the provider's token count when present.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub tokens_used: Option<u64>,
}

/// Transport abstraction over a chat-completion endpoint.
#[async_trait]
pub trait ChatClient: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn chat_completion(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f64,
    ) -> Result<ChatResponse, LlmError>;
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f64,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<u64>,
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Production transport backed by reqwest with a 60 s deadline.
pub struct HttpChatClient {
    http: reqwest::Client,
}

impl HttpChatClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self { http }
    }
}

impl Default for HttpChatClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn chat_completion(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f64,
    ) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let body = CompletionRequest {
            model,
            messages,
            max_tokens,
            temperature,
        };

        debug!(url = %url, model, max_tokens, "dispatching chat completion");

        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(REQUEST_TIMEOUT_SECS)
                } else {
                    LlmError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            // Reset hints sometimes arrive as headers rather than body text;
            // fold them into the classified text so parsing sees both.
            let header_hint = response
                .headers()
                .get("x-ratelimit-reset")
                .and_then(|v| v.to_str().ok())
                .map(|v| format!(" X-RateLimit-Reset: {v}"))
                .unwrap_or_default();
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_failure(
                Some(status.as_u16()),
                &format!("{body_text}{header_hint}"),
                Utc::now(),
            ));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("malformed completion response: {e}")))?;

        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::Parse("completion response had no choices".to_string()))?;

        Ok(ChatResponse {
            text,
            tokens_used: parsed.usage.and_then(|u| u.total_tokens),
        })
    }
}

/// Whitespace-token estimate used when the provider reports no usage.
pub fn estimate_tokens(texts: &[&str]) -> u64 {
    let count: usize = texts.iter().map(|t| t.split_whitespace().count()).sum();
    count.max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let m = ChatMessage::system("you are a trading assistant");
        assert_eq!(m.role, "system");
        let m = ChatMessage::user("ping");
        assert_eq!(m.role, "user");
    }

    #[test]
    fn request_wire_shape() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let req = CompletionRequest {
            model: "m",
            messages: &messages,
            max_tokens: 100,
            temperature: 0.3,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "m");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "u");
        assert_eq!(json["max_tokens"], 100);
    }

    #[test]
    fn response_wire_shape() {
        let raw = r#"{"choices":[{"message":{"content":"hello"}}],"usage":{"total_tokens":42}}"#;
        let parsed: CompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hello");
        assert_eq!(parsed.usage.unwrap().total_tokens, Some(42));
    }

    #[test]
    fn token_estimate_counts_whitespace_tokens() {
        assert_eq!(estimate_tokens(&["one two three", "four"]), 4);
        assert_eq!(estimate_tokens(&[""]), 1, "estimate never reads zero");
    }
}

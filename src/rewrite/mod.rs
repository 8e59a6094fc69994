//! Client for the chat-completions service that translates and tidies email bodies.

use crate::config::Config;
use crate::http::{self, HttpClient};
use crate::pipeline::Rewriter;
use async_trait::async_trait;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};

pub const SYSTEM_PROMPT: &str = "You are an email assistant. You author well-written markdown emails based on the original email, cleaning up any extra spaces, emojis, and unnecessary details like footers, unsubscribe links, call to actions, etc. Always rewrite the email in english regardless of original language.";

pub const USER_PROMPT: &str = "Translate this email to english if it's in a different language. Clean it up if it's English. Reply with the markdown only, no prefaces or disclaimers and no fenced code blocks. ";

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("rewrite request failed: {0:#}")]
    Transport(anyhow::Error),
    #[error("rewrite service responded with {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("rewrite response had no completion text: {0}")]
    MalformedResponse(String),
    #[error("rewrite service returned an empty completion")]
    EmptyCompletion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatCompletionRequest {
    /// The two-message conversation sent for every email.
    pub fn for_body(model: &str, body: &str) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!("{}\n\n{}", USER_PROMPT, body),
                },
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Pulls `choices[0].message.content` out of a completion response body.
pub fn completion_text(body: &[u8]) -> Result<String, RewriteError> {
    let response: ChatCompletionResponse = serde_json::from_slice(body)
        .map_err(|e| RewriteError::MalformedResponse(e.to_string()))?;

    let content = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| RewriteError::MalformedResponse("no choices".to_string()))?
        .message
        .ok_or_else(|| RewriteError::MalformedResponse("first choice has no message".to_string()))?
        .content
        .ok_or_else(|| RewriteError::MalformedResponse("message has no content".to_string()))?;

    if content.trim().is_empty() {
        return Err(RewriteError::EmptyCompletion);
    }
    Ok(content)
}

pub struct RewriteClient {
    client: HttpClient,
    url: String,
    model: String,
    api_key: String,
}

impl RewriteClient {
    pub fn new(config: &Config, client: HttpClient) -> Self {
        Self {
            client,
            url: config.rewrite_url.clone(),
            model: config.rewrite_model.clone(),
            api_key: config.rewrite_api_key.clone(),
        }
    }

    /// Sends one completion request and returns the rewritten body.
    ///
    /// Makes a single attempt; the caller decides what a failure means for the
    /// message.
    pub async fn rewrite(&self, body: &str) -> Result<String, RewriteError> {
        tracing::info!("Rewriting email with model {}", self.model);

        let request = ChatCompletionRequest::for_body(&self.model, body);
        let json_body = serde_json::to_string(&request)
            .map_err(|e| RewriteError::Transport(anyhow::Error::new(e)))?;

        let response = http::post_json(&self.client, &self.url, Some(&self.api_key), json_body)
            .await
            .map_err(RewriteError::Transport)?;

        if !response.status.is_success() {
            return Err(RewriteError::Status {
                status: response.status,
                body: response.text(),
            });
        }

        let content = completion_text(&response.body)?;
        tracing::debug!("Rewrite returned {} bytes", content.len());
        Ok(content)
    }
}

#[async_trait]
impl Rewriter for RewriteClient {
    async fn rewrite(&self, body: &str) -> Result<String, RewriteError> {
        RewriteClient::rewrite(self, body).await
    }
}

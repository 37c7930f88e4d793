//! Model client for AI inference using OpenAI-compatible API.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

use super::service::{LocateService, PlanRequest, PlanService};
use crate::error::EngineError;
use crate::types::{LocateParam, LocateResultElement, Plan, UiContext};

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

const LOCATE_SYSTEM_PROMPT: &str = "You locate user interface elements in a screenshot. \
Reply with a JSON object {\"elements\": [{\"bbox\": [x1, y1, x2, y2], \"description\": \"...\"}], \"errors\": []} \
using pixel coordinates of the screenshot. Return an empty list when nothing matches.";

const LOCATE_ALL_HINT: &str = "Return every element that matches, ordered top-to-bottom then left-to-right.";

const PLAN_SYSTEM_PROMPT: &str = "You plan user interface actions. \
Reply with a JSON object {\"actions\": [{\"type\": \"<action name>\", \"param\": {...}, \"thought\": \"...\"}], \
\"moreActionsNeededByInstruction\": false, \"log\": \"...\", \"error\": null}. \
Only use the actions listed. A locate param is {\"prompt\": \"...\", \"bbox\": [x1, y1, x2, y2]}.";

static JSON_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("json fence pattern is valid")
});

/// Model client errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("API error ({status}): {body}")]
    ApiError { status: u16, body: String },
    #[error("Max retries exceeded after {0} attempts: {1}")]
    MaxRetriesExceeded(u32, String),
}

impl ModelError {
    /// Network errors, server errors and rate limits are worth retrying.
    fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed(_) => true,
            Self::ApiError { status, body } => {
                *status == 429
                    || (500..600).contains(status)
                    || body.to_lowercase().contains("rate limit")
            }
            Self::ParseError(_) | Self::MaxRetriesExceeded(_, _) => false,
        }
    }
}

/// Configuration for the AI model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub extra_body: HashMap<String, Value>,
    /// Maximum number of retry attempts for failed requests.
    pub max_retries: u32,
    /// Delay between retry attempts in seconds.
    pub retry_delay_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "gpt-4o".to_string(),
            max_tokens: 3000,
            temperature: 0.0,
            top_p: 0.85,
            extra_body: HashMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl ModelConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Set the maximum number of retry attempts for failed requests.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between retry attempts in seconds.
    pub fn with_retry_delay(mut self, delay_secs: u64) -> Self {
        self.retry_delay_secs = delay_secs;
        self
    }
}

/// OpenAI API response structures.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

#[derive(Debug, Deserialize)]
struct LocateReply {
    #[serde(default)]
    elements: Vec<LocatedBox>,
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LocatedBox {
    bbox: [f64; 4],
    #[serde(default)]
    description: Option<String>,
}

/// Client for OpenAI-compatible vision-language models.
pub struct ModelClient {
    config: ModelConfig,
    client: Client,
}

impl ModelClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ModelConfig::default())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Send chat messages and return the raw reply text, retrying transient failures.
    pub async fn request(&self, messages: &[Value]) -> Result<String, ModelError> {
        let url = format!("{}/chat/completions", self.config.base_url);

        let mut body = json!({
            "messages": messages,
            "model": self.config.model_name,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
        });

        if let Value::Object(ref mut map) = body {
            for (key, value) in &self.config.extra_body {
                map.insert(key.clone(), value.clone());
            }
        }

        let mut last_error: Option<ModelError> = None;
        let max_attempts = self.config.max_retries + 1;

        for attempt in 1..=max_attempts {
            match self.send_request(&url, &body).await {
                Ok(content) => return Ok(content),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt < max_attempts {
                        tracing::warn!(
                            "Model request failed (attempt {}/{}): {}, retrying in {}s",
                            attempt,
                            max_attempts,
                            e,
                            self.config.retry_delay_secs
                        );
                        sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(ModelError::MaxRetriesExceeded(
            max_attempts,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }

    async fn send_request(&self, url: &str, body: &Value) -> Result<String, ModelError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ModelError::ParseError("No choices in response".to_string()))
    }

    /// Pull the JSON object out of a reply that may wrap it in prose or a code fence.
    fn extract_json(content: &str) -> Result<Value, ModelError> {
        let candidate = match JSON_FENCE.captures(content).and_then(|c| c.get(1)) {
            Some(m) => m.as_str(),
            None => {
                let start = content.find('{');
                let end = content.rfind('}');
                match (start, end) {
                    (Some(start), Some(end)) if end > start => &content[start..=end],
                    _ => {
                        return Err(ModelError::ParseError(format!(
                            "no JSON object in reply: {}",
                            content
                        )))
                    }
                }
            }
        };
        serde_json::from_str(candidate).map_err(|e| ModelError::ParseError(e.to_string()))
    }

    fn parse_locate_reply(content: &str) -> Result<Vec<LocateResultElement>, ModelError> {
        let reply: LocateReply = serde_json::from_value(Self::extract_json(content)?)
            .map_err(|e| ModelError::ParseError(e.to_string()))?;
        if !reply.errors.is_empty() {
            tracing::debug!("Locate reply carried errors: {:?}", reply.errors);
        }
        Ok(reply
            .elements
            .into_iter()
            .map(|located| {
                let element = LocateResultElement::from_bbox(located.bbox);
                match located.description {
                    Some(description) => element.with_description(description),
                    None => element,
                }
            })
            .collect())
    }

    async fn locate_with(
        &self,
        prompt: &str,
        hint: Option<&str>,
        context: &UiContext,
    ) -> Result<Vec<LocateResultElement>, ModelError> {
        let mut text = format!("Find: {}", prompt);
        if let Some(hint) = hint {
            text.push('\n');
            text.push_str(hint);
        }
        let messages = [
            MessageBuilder::create_system_message(LOCATE_SYSTEM_PROMPT),
            MessageBuilder::create_user_message(&text, Some(context)),
        ];
        let content = self.request(&messages).await?;
        Self::parse_locate_reply(&content)
    }
}

#[async_trait]
impl LocateService for ModelClient {
    async fn locate(
        &self,
        param: &LocateParam,
        context: &UiContext,
    ) -> Result<Vec<LocateResultElement>, EngineError> {
        let hint = param
            .deep_think
            .filter(|deep| *deep)
            .map(|_| "Look closely; the target may be small or partially hidden.");
        Ok(self.locate_with(&param.prompt, hint, context).await?)
    }

    async fn locate_all(
        &self,
        prompt: &str,
        context: &UiContext,
    ) -> Result<Vec<LocateResultElement>, EngineError> {
        Ok(self
            .locate_with(prompt, Some(LOCATE_ALL_HINT), context)
            .await?)
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }
}

#[async_trait]
impl PlanService for ModelClient {
    async fn plan(&self, request: PlanRequest) -> Result<Plan, EngineError> {
        let mut text = format!(
            "Instruction: {}\nAvailable actions: {}",
            request.instruction,
            Value::Array(request.action_space.clone())
        );
        if let Some(log) = &request.previous_log {
            text.push_str(&format!("\nAlready done: {}", log));
        }
        if let Some(context) = &request.action_context {
            text.push_str(&format!("\nContext: {}", context));
        }

        let messages = [
            MessageBuilder::create_system_message(PLAN_SYSTEM_PROMPT),
            MessageBuilder::create_user_message(&text, Some(&request.ui_context)),
        ];
        let content = self.request(&messages).await?;
        let plan: Plan = serde_json::from_value(Self::extract_json(&content)?)
            .map_err(|e| ModelError::ParseError(e.to_string()))?;
        Ok(plan)
    }
}

/// Builds chat messages.
pub struct MessageBuilder;

impl MessageBuilder {
    pub fn create_system_message(content: &str) -> Value {
        json!({
            "role": "system",
            "content": content
        })
    }

    /// User message with an optional screenshot attached first.
    pub fn create_user_message(text: &str, context: Option<&UiContext>) -> Value {
        let mut content = Vec::new();

        if let Some(context) = context {
            content.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": context.screenshot_data_url()
                }
            }));
        }

        content.push(json!({
            "type": "text",
            "text": text
        }));

        json!({
            "role": "user",
            "content": content
        })
    }
}

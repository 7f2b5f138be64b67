//! OpenAI-compatible vision backend (chat completions with an inline image).
//!
//! Works against OpenAI, OpenRouter, and any server speaking the same
//! `/chat/completions` dialect.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{OcrBackend, OcrError, OcrInput, ProgressReporter, VISION_OCR_PROMPT};
use crate::config::VisionSettings;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiVisionBackend {
    id: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    concurrency: usize,
    timeout: Duration,
}

impl OpenAiVisionBackend {
    pub fn new(id: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            id: id.into(),
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 4096,
            concurrency: 2,
            timeout: Duration::from_secs(60),
        }
    }

    /// Build from settings, reading the key from `OPENAI_API_KEY` unless the
    /// settings carry one.
    pub fn from_settings(settings: &VisionSettings) -> Self {
        let api_key = settings
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());

        Self::new(settings.id.as_deref().unwrap_or("openai"), api_key)
            .with_base_url(settings.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))
            .with_model(settings.model.as_deref().unwrap_or(DEFAULT_MODEL))
            .with_concurrency(settings.concurrency)
            .with_timeout(Duration::from_secs(settings.timeout_secs))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ── Chat completions request/response types ─────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[async_trait::async_trait]
impl OcrBackend for OpenAiVisionBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn concurrency_limit(&self) -> usize {
        self.concurrency
    }

    fn is_ready(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    async fn recognize(
        &self,
        input: &OcrInput,
        progress: &ProgressReporter,
    ) -> Result<String, OcrError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| OcrError::NotReady(format!("{}: API key not set", self.id)))?;

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: VISION_OCR_PROMPT.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: input.data_url(),
                        },
                    },
                ],
            }],
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };

        info!(
            "{}: sending {} ({} bytes) to model {}",
            self.id,
            input.file_id,
            input.data.len(),
            self.model
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    OcrError::Timeout(self.timeout)
                } else {
                    OcrError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OcrError::Api {
                status: status.as_u16(),
                body,
            });
        }
        progress.report(80);

        let raw = response.text().await?;
        debug!("{}: raw response ({} bytes)", self.id, raw.len());
        let parsed: ChatCompletionResponse =
            serde_json::from_str(&raw).map_err(|e| OcrError::Decode(e.to_string()))?;

        if let Some(usage) = &parsed.usage {
            debug!(
                "{}: usage prompt={} completion={}",
                self.id, usage.prompt_tokens, usage.completion_tokens
            );
        }

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(OcrError::EmptyResponse);
        }
        Ok(text)
    }
}

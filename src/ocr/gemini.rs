//! Google Gemini vision backend (`generateContent` with inline image data).

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{OcrBackend, OcrError, OcrInput, ProgressReporter, VISION_OCR_PROMPT};
use crate::config::VisionSettings;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

pub struct GeminiBackend {
    id: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    concurrency: usize,
    timeout: Duration,
}

impl GeminiBackend {
    pub fn new(id: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            id: id.into(),
            client: Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            concurrency: 2,
            timeout: Duration::from_secs(60),
        }
    }

    /// Build from settings; the key falls back to `GEMINI_API_KEY`.
    pub fn from_settings(settings: &VisionSettings) -> Self {
        let api_key = settings
            .api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok());

        Self::new(settings.id.as_deref().unwrap_or("gemini"), api_key)
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

// ── Gemini API request/response types ───────────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[async_trait::async_trait]
impl OcrBackend for GeminiBackend {
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
            .ok_or_else(|| OcrError::NotReady(format!("{}: GEMINI_API_KEY not set", self.id)))?;

        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text {
                        text: VISION_OCR_PROMPT.to_string(),
                    },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: input.mime_type().to_string(),
                            data: input.to_base64(),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: 8192,
            },
        };

        info!(
            "{}: sending {} ({} bytes) to {}",
            self.id,
            input.file_id,
            input.data.len(),
            self.model
        );

        let response = self
            .client
            .post(format!("{}/models/{}:generateContent", self.base_url, self.model))
            .query(&[("key", api_key)])
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
        let parsed: GenerateResponse =
            serde_json::from_str(&raw).map_err(|e| OcrError::Decode(e.to_string()))?;

        if let Some(error) = parsed.error {
            return Err(OcrError::Failed(format!("Gemini API error: {}", error.message)));
        }

        // A candidate may split its answer over several text parts.
        let text = parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .map(|t| t.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(OcrError::EmptyResponse);
        }
        Ok(text)
    }
}

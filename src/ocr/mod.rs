//! OCR backend abstraction.
//!
//! Defines the [`OcrBackend`] capability and the unified types shared by every
//! backend (local Tesseract workers, OpenAI-compatible vision chat, Gemini) so the
//! orchestrator can fan work out without knowing which engine sits behind an id.

pub mod gemini;
pub mod local;
pub mod openai;
pub mod tesseract;

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::ImageFormat;
use thiserror::Error;

/// Instruction sent to vision models alongside the image.
pub const VISION_OCR_PROMPT: &str = "Extract all text visible in this image exactly as written. \
Preserve IP addresses, domain names, URLs, file paths and hashes character for character. \
Return only the extracted text with no commentary. If the image contains no text, return an empty response.";

/// Errors from OCR backends.
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("Backend not available: {0}")]
    NotReady(String),

    #[error("Backend is shutting down")]
    ShuttingDown,

    #[error("Recognition failed: {0}")]
    Failed(String),

    #[error("Backend returned no text")]
    EmptyResponse,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OcrError {
    /// Whether resubmitting the same image could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            OcrError::NotReady(_)
            | OcrError::ShuttingDown
            | OcrError::Timeout(_)
            | OcrError::Io(_) => true,
            OcrError::Api { status, .. } => *status == 429 || *status >= 500,
            OcrError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            OcrError::Failed(_) | OcrError::EmptyResponse | OcrError::Decode(_) => false,
        }
    }
}

/// Image handed to a backend. The bytes are shared between every backend
/// processing the same attachment.
#[derive(Debug, Clone)]
pub struct OcrInput {
    pub file_id: String,
    pub data: Arc<[u8]>,
}

impl OcrInput {
    pub fn new(file_id: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            file_id: file_id.into(),
            data: data.into(),
        }
    }

    /// MIME type sniffed from magic bytes, falling back to PNG.
    pub fn mime_type(&self) -> &'static str {
        match image::guess_format(&self.data) {
            Ok(ImageFormat::Jpeg) => "image/jpeg",
            Ok(ImageFormat::Gif) => "image/gif",
            Ok(ImageFormat::WebP) => "image/webp",
            Ok(ImageFormat::Bmp) => "image/bmp",
            Ok(ImageFormat::Tiff) => "image/tiff",
            _ => "image/png",
        }
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }

    /// `data:` URL for APIs that take inline images by URL.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), self.to_base64())
    }
}

/// Sink for intermediate progress (0-99) of a single recognition.
#[derive(Clone)]
pub struct ProgressReporter {
    report: Arc<dyn Fn(u8) + Send + Sync>,
}

impl ProgressReporter {
    pub fn new(report: impl Fn(u8) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    /// A reporter that drops every update.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, percent: u8) {
        (self.report)(percent.min(99));
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressReporter")
    }
}

/// Async capability implemented by each OCR backend.
///
/// `recognize` may be called concurrently up to [`OcrBackend::concurrency_limit`]
/// times; the job queue owning the backend enforces the limit.
#[async_trait::async_trait]
pub trait OcrBackend: Send + Sync {
    /// Stable identifier used as the cache and event key.
    fn id(&self) -> &str;

    fn concurrency_limit(&self) -> usize;

    /// False when the backend cannot take new work (missing key, engine down).
    fn is_ready(&self) -> bool {
        true
    }

    async fn recognize(
        &self,
        input: &OcrInput,
        progress: &ProgressReporter,
    ) -> Result<String, OcrError>;

    /// Release any persistent resource. In-flight work must fail with
    /// [`OcrError::ShuttingDown`] rather than hang.
    async fn shutdown(&self) {}
}

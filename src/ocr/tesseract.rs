//! Tesseract engine driven through the command-line binary.

use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use super::local::{LocalBackend, RecognitionEngine};
use super::OcrError;
use crate::config::LocalSettings;

#[derive(Debug, Clone)]
pub struct TesseractEngine {
    binary: PathBuf,
    language: String,
}

impl TesseractEngine {
    pub fn new(binary: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
        }
    }

    /// Probe the binary with `--version`.
    pub fn check_available(&self) -> Result<(), OcrError> {
        match Command::new(&self.binary).arg("--version").output() {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(OcrError::NotReady(format!(
                "{} --version failed: {}",
                self.binary.display(),
                String::from_utf8_lossy(&output.stderr)
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(OcrError::NotReady(format!(
                "{} not found (install tesseract-ocr)",
                self.binary.display()
            ))),
            Err(e) => Err(OcrError::Io(e)),
        }
    }
}

impl RecognitionEngine for TesseractEngine {
    fn recognize(&mut self, image: &[u8]) -> Result<String, OcrError> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(image)?;
        file.flush()?;

        let output = Command::new(&self.binary)
            .arg(file.path())
            .arg("stdout")
            .args(["-l", &self.language])
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
                debug!("tesseract: {} chars recognized", text.len());
                if text.is_empty() {
                    Err(OcrError::EmptyResponse)
                } else {
                    Ok(text)
                }
            }
            Ok(output) => Err(OcrError::Failed(format!(
                "tesseract failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(OcrError::NotReady(
                "tesseract not found (install tesseract-ocr)".to_string(),
            )),
            Err(e) => Err(OcrError::Io(e)),
        }
    }
}

/// Start a local backend with one Tesseract engine per configured worker.
pub fn spawn_backend(settings: &LocalSettings) -> Result<LocalBackend, OcrError> {
    let binary = std::env::var("TESSERACT_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| settings.binary.clone());
    let engine = TesseractEngine::new(binary, settings.language.clone());
    engine.check_available()?;

    let engines = vec![engine; settings.concurrency.max(1)];
    LocalBackend::spawn(
        settings.id.as_deref().unwrap_or("tesseract"),
        engines,
        Duration::from_secs(settings.timeout_secs),
    )
}

/// [`spawn_backend`] off the async runtime. Checking the binary runs a
/// child process to completion.
pub async fn start_backend(settings: LocalSettings) -> Result<LocalBackend, OcrError> {
    tokio::task::spawn_blocking(move || spawn_backend(&settings))
        .await
        .map_err(|e| OcrError::Failed(format!("Tesseract startup task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_is_not_ready() {
        let mut engine = TesseractEngine::new("/nonexistent/tesseract-binary", "eng");
        assert!(matches!(engine.check_available(), Err(OcrError::NotReady(_))));
        assert!(matches!(
            engine.recognize(&[0u8; 8]),
            Err(OcrError::NotReady(_))
        ));
    }

    #[test]
    fn test_spawn_backend_fails_without_binary() {
        let settings = LocalSettings {
            binary: PathBuf::from("/nonexistent/tesseract-binary"),
            ..LocalSettings::default()
        };
        if std::env::var("TESSERACT_PATH").is_err() {
            assert!(spawn_backend(&settings).is_err());
        }
    }

    #[tokio::test]
    async fn test_start_backend_reports_missing_binary() {
        let settings = LocalSettings {
            binary: PathBuf::from("/nonexistent/tesseract-binary"),
            ..LocalSettings::default()
        };
        if std::env::var("TESSERACT_PATH").is_err() {
            assert!(matches!(
                start_backend(settings).await,
                Err(OcrError::NotReady(_))
            ));
        }
    }
}

//! Indicator extraction from recognized text.
//!
//! The orchestrator only depends on the [`IndicatorExtractor`] trait. The
//! [`PatternExtractor`] here compiles configured regex patterns; pure functions,
//! no async.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::IndicatorPattern;

/// A typed security-relevant value found in recognized text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Indicator {
    pub kind: String,
    pub value: String,
}

impl Indicator {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

/// Converts recognized text into indicators.
pub trait IndicatorExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Vec<Indicator>;
}

impl<F> IndicatorExtractor for F
where
    F: Fn(&str) -> Vec<Indicator> + Send + Sync,
{
    fn extract(&self, text: &str) -> Vec<Indicator> {
        self(text)
    }
}

/// Pre-compiled regex patterns ready for matching.
pub struct PatternExtractor {
    patterns: Vec<CompiledPattern>,
}

struct CompiledPattern {
    id: String,
    regex: Regex,
    normalize: Option<String>,
    deduplicate: bool,
}

impl PatternExtractor {
    /// Compile indicator patterns from settings. Skips invalid regexes with a warning.
    pub fn compile(patterns: &[IndicatorPattern]) -> Self {
        let mut compiled = Vec::new();
        for p in patterns {
            match Regex::new(&p.pattern) {
                Ok(regex) => compiled.push(CompiledPattern {
                    id: p.id.clone(),
                    regex,
                    normalize: p.normalize.clone(),
                    deduplicate: p.deduplicate,
                }),
                Err(e) => {
                    warn!(
                        "Skipping invalid indicator pattern '{}' ({}): {}",
                        p.label, p.pattern, e
                    );
                }
            }
        }
        debug!("Compiled {} indicator patterns", compiled.len());
        Self { patterns: compiled }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

impl IndicatorExtractor for PatternExtractor {
    fn extract(&self, text: &str) -> Vec<Indicator> {
        let mut found = Vec::new();

        for pattern in &self.patterns {
            let mut seen = HashSet::new();

            for cap in pattern.regex.captures_iter(text) {
                // Use first capture group if available, otherwise full match
                let raw = cap
                    .get(1)
                    .or_else(|| cap.get(0))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                if raw.is_empty() {
                    continue;
                }

                let value = normalize_value(raw, pattern.normalize.as_deref());
                if pattern.deduplicate && !seen.insert(value.clone()) {
                    continue;
                }
                found.push(Indicator::new(pattern.id.clone(), value));
            }
        }

        found
    }
}

/// Apply normalization to a matched value.
fn normalize_value(value: &str, normalize: Option<&str>) -> String {
    match normalize {
        Some("lowercase") => value.to_lowercase(),
        Some("uppercase") => value.to_uppercase(),
        Some("refang") => refang(value),
        _ => value.to_string(),
    }
}

/// Undo common defanging (`1.2.3[.]4`, `evil(dot)com`, `hxxp://`).
fn refang(value: &str) -> String {
    value
        .replace("[.]", ".")
        .replace("(.)", ".")
        .replace("(dot)", ".")
        .replace("[dot]", ".")
        .replace("hxxp", "http")
        .to_lowercase()
}

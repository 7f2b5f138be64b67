//! Session result cache: `file_id → (backend_id → indicators)`.
//!
//! Besides completed results the cache tracks *claims*: (file, backend) pairs
//! admitted to a queue but not finished yet. A claim is taken synchronously at
//! admission, so two batches racing over the same attachment cannot both
//! enqueue it.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::indicators::Indicator;

#[derive(Debug, Default)]
pub struct ResultCache {
    entries: HashMap<String, HashMap<String, Vec<Indicator>>>,
    claims: HashSet<(String, String)>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_cached(&self, file_id: &str, backend_id: &str) -> bool {
        self.entries
            .get(file_id)
            .is_some_and(|by_backend| by_backend.contains_key(backend_id))
    }

    pub fn is_claimed(&self, file_id: &str, backend_id: &str) -> bool {
        self.claims
            .contains(&(file_id.to_string(), backend_id.to_string()))
    }

    /// Claim a pair for processing. Fails if it already has a result or an
    /// outstanding claim.
    pub fn claim(&mut self, file_id: &str, backend_id: &str) -> bool {
        if self.has_cached(file_id, backend_id) {
            return false;
        }
        self.claims
            .insert((file_id.to_string(), backend_id.to_string()))
    }

    /// Drop a claim without recording a result (failure or cancellation).
    pub fn release(&mut self, file_id: &str, backend_id: &str) {
        self.claims
            .remove(&(file_id.to_string(), backend_id.to_string()));
    }

    /// Store a result and release the claim. The first result for a pair wins;
    /// returns false if one was already present.
    pub fn record(&mut self, file_id: &str, backend_id: &str, indicators: Vec<Indicator>) -> bool {
        self.release(file_id, backend_id);
        let by_backend = self.entries.entry(file_id.to_string()).or_default();
        if by_backend.contains_key(backend_id) {
            return false;
        }
        debug!(
            "ResultCache: recorded {} indicators for '{}' from {}",
            indicators.len(),
            file_id,
            backend_id
        );
        by_backend.insert(backend_id.to_string(), indicators);
        true
    }

    /// Per-backend results for one file.
    pub fn get(&self, file_id: &str) -> Option<&HashMap<String, Vec<Indicator>>> {
        self.entries.get(file_id)
    }

    /// Indicators for one file merged across backends, first occurrence kept,
    /// backends visited in id order.
    pub fn merged(&self, file_id: &str) -> Vec<Indicator> {
        let Some(by_backend) = self.entries.get(file_id) else {
            return Vec::new();
        };
        let mut backend_ids: Vec<_> = by_backend.keys().collect();
        backend_ids.sort();

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for id in backend_ids {
            for indicator in &by_backend[id] {
                if seen.insert(indicator) {
                    merged.push(indicator.clone());
                }
            }
        }
        merged
    }

    /// Forget every result for a file, e.g. after the attachment changed.
    pub fn invalidate(&mut self, file_id: &str) -> bool {
        self.entries.remove(file_id).is_some()
    }

    /// Forget all results. Outstanding claims are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of (file, backend) results held.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_lookup() {
        let mut cache = ResultCache::new();
        assert!(!cache.has_cached("a.png", "fast"));

        assert!(cache.record("a.png", "fast", vec![Indicator::new("ipv4", "1.2.3.4")]));
        assert!(cache.has_cached("a.png", "fast"));
        assert!(!cache.has_cached("a.png", "slow"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_first_result_wins() {
        let mut cache = ResultCache::new();
        assert!(cache.record("a.png", "fast", vec![Indicator::new("ipv4", "1.2.3.4")]));
        assert!(!cache.record("a.png", "fast", vec![]));
        assert_eq!(cache.get("a.png").unwrap()["fast"].len(), 1);
    }

    #[test]
    fn test_claims_block_double_admission() {
        let mut cache = ResultCache::new();
        assert!(cache.claim("a.png", "fast"));
        assert!(!cache.claim("a.png", "fast"));
        assert!(cache.is_claimed("a.png", "fast"));

        cache.release("a.png", "fast");
        assert!(cache.claim("a.png", "fast"));

        cache.record("a.png", "fast", vec![]);
        assert!(!cache.is_claimed("a.png", "fast"));
        assert!(!cache.claim("a.png", "fast"));
    }

    #[test]
    fn test_merged_dedups_across_backends() {
        let mut cache = ResultCache::new();
        cache.record(
            "a.png",
            "slow",
            vec![Indicator::new("domain", "evil.com"), Indicator::new("ipv4", "1.1.1.1")],
        );
        cache.record("a.png", "fast", vec![Indicator::new("ipv4", "1.1.1.1")]);

        assert_eq!(
            cache.merged("a.png"),
            vec![Indicator::new("ipv4", "1.1.1.1"), Indicator::new("domain", "evil.com")]
        );
        assert!(cache.merged("missing.png").is_empty());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let mut cache = ResultCache::new();
        cache.record("a.png", "fast", vec![]);
        cache.record("b.png", "fast", vec![]);

        assert!(cache.invalidate("a.png"));
        assert!(!cache.invalidate("a.png"));
        assert!(!cache.has_cached("a.png", "fast"));

        cache.clear();
        assert!(cache.is_empty());
    }
}

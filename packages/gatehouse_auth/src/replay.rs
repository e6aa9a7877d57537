//! Replay detection for API signatures.

use std::collections::HashMap;

/// Signatures accepted during this server's lifetime.
///
/// Each entry remembers when its signed timestamp leaves the acceptance
/// window. Past that point a replay would fail the expiry check anyway, so
/// the entry can be dropped without weakening replay detection.
#[derive(Debug, Default)]
pub struct SignatureRecord {
    entries: HashMap<String, i64>,
}

impl SignatureRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.entries.contains_key(signature)
    }

    /// Record `signature`, relevant until `expires_at_ms`.
    pub fn insert(&mut self, signature: &str, expires_at_ms: i64) {
        self.entries.insert(signature.to_string(), expires_at_ms);
    }

    /// Drop every entry whose window closed before `now_ms`.
    pub fn evict_expired(&mut self, now_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at >= now_ms);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

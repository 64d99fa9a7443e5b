//! Process-lifetime ban list.
//!
//! Loaded once at startup from an optional JSON file and never mutated
//! afterwards; an entry matches a connecting client if either its IP or its
//! opaque unique identifier matches.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BanEntry {
    pub ip: String,
    pub unique_id: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct BanRegistry {
    entries: Vec<BanEntry>,
}

impl BanRegistry {
    pub fn new(entries: Vec<BanEntry>) -> Self {
        Self { entries }
    }

    /// Reads a JSON array of ban entries, e.g.
    /// `[{"ip": "10.0.0.4", "unique_id": [1, 2, 3]}]`.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let data = std::fs::read_to_string(path)?;
        let entries: Vec<BanEntry> = serde_json::from_str(&data)?;
        Ok(Self::new(entries))
    }

    pub fn is_banned(&self, ip: &str, unique_id: &[u8]) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.ip == ip || entry.unique_id == unique_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub query: String,
    pub evidence: String,
}

pub fn cache_key(query: &str) -> String {
    hex::encode(Sha256::digest(query.as_bytes()))
}

/// Web evidence keyed by the SHA-256 of the query text.
///
/// Saving re-reads the file and merges it under the in-memory entries, so
/// concurrent writers lose nothing but the races they lose (last writer wins).
#[derive(Debug, Default)]
pub struct EvidenceCache {
    path: Option<PathBuf>,
    entries: HashMap<String, CacheEntry>,
}

impl EvidenceCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = read_entries(&path);
        debug!(path = %path.display(), size = entries.len(), "web cache loaded");
        Self { path: Some(path), entries }
    }

    pub fn get(&self, query: &str) -> Option<&str> {
        self.entries
            .get(&cache_key(query))
            .filter(|e| e.query == query)
            .map(|e| e.evidence.as_str())
    }

    pub fn insert(&mut self, query: &str, evidence: String) {
        self.entries.insert(cache_key(query), CacheEntry { query: query.to_string(), evidence });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if self.is_empty() {
            return Ok(());
        }
        let mut merged = read_entries(path);
        merged.extend(self.entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&merged)?)?;
        Ok(())
    }
}

fn read_entries(path: &Path) -> HashMap<String, CacheEntry> {
    let Ok(bytes) = std::fs::read(path) else {
        return HashMap::new();
    };
    serde_json::from_slice(&bytes).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "unreadable web cache, starting empty");
        HashMap::new()
    })
}

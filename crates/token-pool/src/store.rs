//! In-memory token registry and its JSON file
//!
//! `PoolStore` is the single source of truth for token state. It keeps entries
//! in insertion order (selection order and round-robin depend on it) and is
//! always persisted as a full snapshot:
//!
//! ```json
//! { "updatedAt": 1735500000000, "tokens": [ { "token": "...", ... } ] }
//! ```
//!
//! Loading never fails: a missing or corrupt file yields an empty pool.
//! Writes use temp file + rename so a crash mid-write leaves the previous
//! snapshot intact.

use std::path::Path;

use common::{has_region_prefix, mask_token};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::entry::TokenEntry;
use crate::error::{Error, Result};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PoolFile<'a> {
    updated_at: u64,
    tokens: &'a [TokenEntry],
}

/// Headline counts for summaries and gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCounts {
    pub total: usize,
    pub enabled: usize,
    pub live: usize,
    pub missing_region: usize,
}

/// Ordered map of token → entry.
#[derive(Debug, Default, Clone)]
pub struct PoolStore {
    entries: Vec<TokenEntry>,
}

impl PoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, token: &str) -> Option<&TokenEntry> {
        self.entries.iter().find(|e| e.token == token)
    }

    pub fn get_mut(&mut self, token: &str) -> Option<&mut TokenEntry> {
        self.entries.iter_mut().find(|e| e.token == token)
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> &[TokenEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [TokenEntry] {
        &mut self.entries
    }

    /// Cloned listing, with tokens masked when `mask_secrets` is set.
    pub fn all(&self, mask_secrets: bool) -> Vec<TokenEntry> {
        self.entries
            .iter()
            .cloned()
            .map(|mut entry| {
                if mask_secrets {
                    entry.token = mask_token(&entry.token);
                }
                entry
            })
            .collect()
    }

    /// Insert a new entry; an existing entry for the same token is left as is.
    ///
    /// Returns whether the entry was inserted.
    pub fn insert_if_absent(&mut self, entry: TokenEntry) -> bool {
        if self.get(&entry.token).is_some() {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Insert or replace, keeping the original position on replace.
    pub fn upsert(&mut self, entry: TokenEntry) {
        match self.get_mut(&entry.token) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn delete(&mut self, token: &str) -> Option<TokenEntry> {
        let idx = self.entries.iter().position(|e| e.token == token)?;
        Some(self.entries.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts {
            total: self.entries.len(),
            ..PoolCounts::default()
        };
        for entry in &self.entries {
            if entry.enabled {
                counts.enabled += 1;
            }
            if entry.is_live() {
                counts.live += 1;
            }
            if entry.region.is_none() {
                counts.missing_region += 1;
            }
        }
        counts
    }

    /// Parse a pool file body, dropping anything unusable.
    ///
    /// Duplicate tokens keep their first record. Region-prefixed tokens are
    /// dropped so the pool never holds the legacy format.
    pub fn from_json(contents: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(contents) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "token pool file is not valid JSON, starting empty");
                return Self::new();
            }
        };

        let Some(records) = value.get("tokens").and_then(|t| t.as_array()) else {
            warn!("token pool file has no tokens array, starting empty");
            return Self::new();
        };

        let mut store = Self::new();
        for record in records {
            let Some(entry) = TokenEntry::from_record(record) else {
                debug!("skipping token pool record without a usable token");
                continue;
            };
            if has_region_prefix(&entry.token) {
                warn!(
                    token = %mask_token(&entry.token),
                    "dropping region-prefixed token from pool file"
                );
                continue;
            }
            store.insert_if_absent(entry);
        }
        store
    }

    /// Load the pool from disk, treating a missing or unreadable file as empty.
    pub async fn load_from_disk(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let store = Self::from_json(&contents);
                info!(path = %path.display(), tokens = store.len(), "loaded token pool");
                store
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "token pool file not found, starting empty");
                Self::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read token pool file, starting empty");
                Self::new()
            }
        }
    }

    /// Serialize the full snapshot stamped with `updated_at` (unix millis).
    pub fn to_json(&self, updated_at: u64) -> Result<String> {
        serde_json::to_string_pretty(&PoolFile {
            updated_at,
            tokens: &self.entries,
        })
        .map_err(|e| Error::Persist(format!("serializing token pool: {e}")))
    }
}

/// Write a pool snapshot to `path` atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Creates the parent directory if needed. Sets 0600 permissions
/// since the file holds session tokens.
pub async fn persist(path: &Path, json: String) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Persist("token pool path has no parent directory".into()))?;

    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Persist(format!("creating token pool directory: {e}")))?;

    let tmp_path = dir.join(format!(".token-pool.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Persist(format!("writing temp token pool file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Persist(format!("setting token pool file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Persist(format!("renaming temp token pool file: {e}")))?;

    debug!(path = %path.display(), "persisted token pool");
    Ok(())
}

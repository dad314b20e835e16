//! JSON-backed key-value cache with age-based expiry (§3a, §9).
//!
//! Generalizes the log follower's cursor-persistence idea to an
//! arbitrary key rather than a single file's read offset. Intended
//! for delta-style sources that need their previous cumulative counter
//! across process restarts (a container CPU-usage source being the
//! canonical example) — the core ships only `self_metrics`/`exec`/
//! `log_tail`, so this type currently has no caller, but the contract
//! is part of the ambient persistence layer those future sources would
//! use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    epoch: f64,
    value: serde_json::Value,
}

/// A single JSON file of `key -> [epoch_seconds, value]`, loaded eagerly
/// and flushed on every write.
pub struct PersistentCache {
    path: PathBuf,
    expire_after: f64,
    entries: HashMap<String, Entry>,
}

impl PersistentCache {
    pub fn load(path: impl Into<PathBuf>, expire_after_secs: f64) -> Self {
        let path = path.into();
        let entries = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<HashMap<String, (f64, serde_json::Value)>>(&text).ok())
            .map(|raw| raw.into_iter().map(|(k, (epoch, value))| (k, Entry { epoch, value })).collect())
            .unwrap_or_default();

        PersistentCache { path, expire_after: expire_after_secs, entries }
    }

    /// Returns the cached value for `key` unless it has aged past the
    /// configured expiry.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        let entry = self.entries.get(key)?;
        if now() - entry.epoch > self.expire_after {
            return None;
        }
        Some(&entry.value)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.insert(key.into(), Entry { epoch: now(), value });
        self.flush();
    }

    /// Drops entries older than the configured expiry; call periodically
    /// from a source that wants to bound the file's growth.
    pub fn evict_expired(&mut self) {
        let cutoff = now() - self.expire_after;
        self.entries.retain(|_, entry| entry.epoch >= cutoff);
        self.flush();
    }

    fn flush(&self) {
        let serializable: HashMap<&str, (f64, &serde_json::Value)> =
            self.entries.iter().map(|(k, e)| (k.as_str(), (e.epoch, &e.value))).collect();
        if let Ok(text) = serde_json::to_string(&serializable) {
            if let Some(parent) = self.path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(err) = std::fs::write(&self.path, text) {
                tracing::warn!(error = %err, path = %self.path.display(), "failed to persist cache");
            }
        }
    }
}

fn now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Derives a cache/cursor filename from an arbitrary source path:
/// strip the leading slash, replace the remaining ones with dashes.
pub fn sanitize_path_component(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "-")
}

pub fn state_file(state_dir: &Path, logical_name: &str, suffix: &str) -> PathBuf {
    state_dir.join(format!("{}.{}", sanitize_path_component(logical_name), suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = PersistentCache::load(&path, 3600.0);
        cache.set("a", serde_json::json!(42));

        let reloaded = PersistentCache::load(&path, 3600.0);
        assert_eq!(reloaded.get("a"), Some(&serde_json::json!(42)));
    }

    #[test]
    fn missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::load(dir.path().join("cache.json"), 3600.0);
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn sanitizes_absolute_paths_into_a_flat_filename() {
        assert_eq!(sanitize_path_component("/var/log/syslog"), "var-log-syslog");
    }
}

//! Durable local state for the enrichment pipeline: snapshot state sets and
//! the write-once payload cache.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use leadflow_core::EntityKind;
use serde_json::Value;
use tokio::fs;
use tracing::debug;

pub const CRATE_NAME: &str = "leadflow-storage";

/// Which lifecycle transition a state set records.
///
/// `Processed` means the payload was downloaded and parsed at least once;
/// `Updated` means a full merge pass finished without error. The pipeline
/// maintains `updated ⊆ processed` by ordering its calls, not the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePhase {
    Processed,
    Updated,
}

impl StatePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatePhase::Processed => "processed",
            StatePhase::Updated => "updated",
        }
    }
}

/// Durable sets of job ids, one JSON file per (kind, phase).
///
/// Each file holds a sorted array of id strings and is rewritten in full on
/// every recorded transition, so a crash loses at most one in-flight job.
#[derive(Debug, Clone)]
pub struct SnapshotStateStore {
    dir: PathBuf,
}

impl SnapshotStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_path(&self, kind: EntityKind, phase: StatePhase) -> PathBuf {
        self.dir
            .join(format!("{}_{}_snapshots.json", phase.as_str(), kind.as_str()))
    }

    pub async fn load(&self, kind: EntityKind, phase: StatePhase) -> Result<HashSet<String>> {
        let path = self.file_path(kind, phase);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking state file {}", path.display()))?
        {
            return Ok(HashSet::new());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading state file {}", path.display()))?;
        let ids: Vec<String> = serde_json::from_str(&text)
            .with_context(|| format!("parsing state file {}", path.display()))?;
        Ok(ids.into_iter().collect())
    }

    /// Insert one id and persist the whole set immediately.
    pub async fn record(&self, kind: EntityKind, phase: StatePhase, id: &str) -> Result<()> {
        let mut ids = self.load(kind, phase).await?;
        if !ids.insert(id.to_string()) {
            return Ok(());
        }
        debug!(id, kind = %kind, phase = phase.as_str(), "recording snapshot transition");
        self.save(kind, phase, &ids).await
    }

    pub async fn save(
        &self,
        kind: EntityKind,
        phase: StatePhase,
        ids: &HashSet<String>,
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating state directory {}", self.dir.display()))?;
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        let bytes = serde_json::to_vec_pretty(&sorted).context("serializing state set")?;
        let path = self.file_path(kind, phase);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing state file {}", path.display()))
    }
}

/// Write-once local cache of downloaded snapshot payloads, one JSON file per
/// job id under a per-kind directory. Files are never mutated after the
/// first write; re-storing an already cached id is a no-op.
#[derive(Debug, Clone)]
pub struct PayloadCache {
    dir: PathBuf,
}

impl PayloadCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn kind_dir(&self, kind: EntityKind) -> PathBuf {
        self.dir.join(kind.as_str())
    }

    fn payload_path(&self, kind: EntityKind, job_id: &str) -> PathBuf {
        self.kind_dir(kind).join(format!("{job_id}.json"))
    }

    /// Store a payload if absent. Returns false when the id was already
    /// cached and the existing file was kept.
    pub async fn store(&self, kind: EntityKind, job_id: &str, payload: &[Value]) -> Result<bool> {
        let path = self.payload_path(kind, job_id);
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking payload path {}", path.display()))?
        {
            return Ok(false);
        }
        let parent = self.kind_dir(kind);
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating payload directory {}", parent.display()))?;

        let bytes = serde_json::to_vec_pretty(payload).context("serializing snapshot payload")?;
        let temp_path = parent.join(format!(".{job_id}.tmp"));
        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing temp payload file {}", temp_path.display()))?;
        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(true),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp payload {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }

    pub async fn contains(&self, kind: EntityKind, job_id: &str) -> Result<bool> {
        let path = self.payload_path(kind, job_id);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking payload path {}", path.display()))
    }

    pub async fn load(&self, kind: EntityKind, job_id: &str) -> Result<Vec<Value>> {
        let path = self.payload_path(kind, job_id);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading payload file {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing payload file {}", path.display()))
    }

    /// Job ids with a cached payload for one entity kind, sorted.
    pub async fn cached_ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        let dir = self.kind_dir(kind);
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking payload directory {}", dir.display()))?
        {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading payload directory {}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("iterating payload directory {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Exponential backoff for retried submissions: base delay doubling per
/// attempt, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn state_sets_round_trip_and_start_empty() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStateStore::new(dir.path());

        let empty = store
            .load(EntityKind::Profile, StatePhase::Processed)
            .await
            .expect("load empty");
        assert!(empty.is_empty());

        store
            .record(EntityKind::Profile, StatePhase::Processed, "s_1")
            .await
            .expect("record");
        store
            .record(EntityKind::Profile, StatePhase::Processed, "s_1")
            .await
            .expect("record duplicate");
        store
            .record(EntityKind::Profile, StatePhase::Processed, "s_2")
            .await
            .expect("record second");

        let loaded = store
            .load(EntityKind::Profile, StatePhase::Processed)
            .await
            .expect("reload");
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains("s_1") && loaded.contains("s_2"));
    }

    #[tokio::test]
    async fn state_sets_are_independent_per_kind_and_phase() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStateStore::new(dir.path());

        store
            .record(EntityKind::Profile, StatePhase::Processed, "s_p")
            .await
            .expect("record profile");
        store
            .record(EntityKind::Company, StatePhase::Updated, "s_c")
            .await
            .expect("record company");

        assert!(store
            .load(EntityKind::Profile, StatePhase::Updated)
            .await
            .expect("load")
            .is_empty());
        assert!(store
            .load(EntityKind::Company, StatePhase::Updated)
            .await
            .expect("load")
            .contains("s_c"));
    }

    #[tokio::test]
    async fn payload_cache_is_write_once() {
        let dir = tempdir().expect("tempdir");
        let cache = PayloadCache::new(dir.path());
        let first = vec![json!({"input_url": "https://linkedin.com/in/jane"})];
        let second = vec![json!({"input_url": "https://linkedin.com/in/bob"})];

        assert!(cache
            .store(EntityKind::Profile, "s_1", &first)
            .await
            .expect("first store"));
        assert!(!cache
            .store(EntityKind::Profile, "s_1", &second)
            .await
            .expect("second store"));

        let loaded = cache
            .load(EntityKind::Profile, "s_1")
            .await
            .expect("load");
        assert_eq!(loaded, first);
    }

    #[tokio::test]
    async fn cached_ids_lists_per_kind() {
        let dir = tempdir().expect("tempdir");
        let cache = PayloadCache::new(dir.path());
        cache
            .store(EntityKind::Profile, "s_b", &[json!({})])
            .await
            .expect("store");
        cache
            .store(EntityKind::Profile, "s_a", &[json!({})])
            .await
            .expect("store");
        cache
            .store(EntityKind::Company, "s_c", &[json!({})])
            .await
            .expect("store");

        assert_eq!(
            cache.cached_ids(EntityKind::Profile).await.expect("ids"),
            vec!["s_a".to_string(), "s_b".to_string()]
        );
        assert_eq!(
            cache.cached_ids(EntityKind::Company).await.expect("ids"),
            vec!["s_c".to_string()]
        );
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(15));
    }
}

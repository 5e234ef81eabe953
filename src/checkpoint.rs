//! Durable per-session processing checkpoints.
//!
//! One JSON file per session in the state directory, named by the sanitised
//! session id. Writes are atomic (tempfile in the same directory + rename);
//! a corrupt or missing checkpoint is never fatal — the caller starts fresh.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::transform::TransformContext;

/// Prefix/suffix for in-flight temp files, so crash debris is recognisable.
const TMP_PREFIX: &str = ".state_";
const TMP_SUFFIX: &str = ".json.tmp";

/// Processing state for one session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    /// Byte offset just past the last consumed newline (or 0).
    pub file_position: u64,
    /// Count of records consumed so far.
    pub line_number: u64,
    /// Transformer state, opaque to this module.
    pub transformer_context: TransformContext,
    /// Highest event sequence issued for this session. Seeds the event
    /// buffer on restore so ids stay strictly increasing across restarts.
    #[serde(default)]
    pub last_event_seq: u64,
    /// Unix seconds of the last save.
    pub last_modified: u64,
}

/// Sanitise a session id for safe filesystem usage.
///
/// Replaces `< > : " / \ | ? *` and control characters with `_`, collapses
/// runs, strips leading/trailing `_` and `.`, and falls back to `"_"` for an
/// empty result. Idempotent.
pub fn sanitize_session_id(session_id: &str) -> String {
    let mut out = String::with_capacity(session_id.len());
    let mut last_was_underscore = false;
    for c in session_id.chars() {
        let mapped = match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        };
        if mapped == '_' {
            if !last_was_underscore {
                out.push('_');
            }
            last_was_underscore = true;
        } else {
            out.push(mapped);
            last_was_underscore = false;
        }
    }
    let trimmed = out.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Stores one checkpoint file per session under the state directory.
#[derive(Clone)]
pub struct CheckpointStore {
    state_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}.json", sanitize_session_id(session_id)))
    }

    pub async fn exists(&self, session_id: &str) -> bool {
        tokio::fs::try_exists(self.path_for(session_id))
            .await
            .unwrap_or(false)
    }

    /// Load a checkpoint. Missing or corrupt files yield `None`.
    pub async fn load(&self, session_id: &str) -> Option<SessionCheckpoint> {
        let path = self.path_for(session_id);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!("corrupt checkpoint {}: {e}, starting fresh", path.display());
                None
            }
        }
    }

    /// Atomically save a checkpoint: write a temp file in the state
    /// directory, then rename over the target.
    pub async fn save(
        &self,
        session_id: &str,
        checkpoint: &SessionCheckpoint,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.state_dir).await?;

        let target = self.path_for(session_id);
        let tmp = self.state_dir.join(format!(
            "{TMP_PREFIX}{}_{}{TMP_SUFFIX}",
            sanitize_session_id(session_id),
            uuid::Uuid::new_v4().simple()
        ));

        let data = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        if let Err(e) = tokio::fs::write(&tmp, data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }

    /// Delete a checkpoint. Missing files are not an error.
    pub async fn delete(&self, session_id: &str) {
        let path = self.path_for(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("deleted checkpoint {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to delete checkpoint {}: {e}", path.display()),
        }
    }

    /// Remove temp-file debris left behind by a crash mid-save.
    pub async fn cleanup_debris(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.state_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(TMP_PREFIX) && name.ends_with(TMP_SUFFIX) {
                warn!("removing stale checkpoint temp file: {name}");
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_session_id("a/b:c*d"), "a_b_c_d");
        assert_eq!(sanitize_session_id("plain-id_01"), "plain-id_01");
    }

    #[test]
    fn test_sanitize_collapses_and_trims() {
        assert_eq!(sanitize_session_id("//weird//id//"), "weird_id");
        assert_eq!(sanitize_session_id("..dots.."), "dots");
        assert_eq!(sanitize_session_id("???"), "_");
        assert_eq!(sanitize_session_id(""), "_");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for raw in ["a/b:c", "..x..", "???", "normal", "a\u{0001}b"] {
            let once = sanitize_session_id(raw);
            assert_eq!(sanitize_session_id(&once), once, "input: {raw:?}");
        }
    }

    fn sample_checkpoint() -> SessionCheckpoint {
        SessionCheckpoint {
            file_position: 1234,
            line_number: 56,
            transformer_context: TransformContext::default(),
            last_event_seq: 78,
            last_modified: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());

        let checkpoint = sample_checkpoint();
        store.save("sess-1", &checkpoint).await.unwrap();
        assert!(store.exists("sess-1").await);

        let loaded = store.load("sess-1").await.unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[tokio::test]
    async fn test_load_corrupt_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        assert!(store.load("bad").await.is_none());
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        assert!(store.load("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        store.save("s", &sample_checkpoint()).await.unwrap();
        store.delete("s").await;
        assert!(!store.exists("s").await);
        store.delete("s").await;
    }

    #[tokio::test]
    async fn test_cleanup_debris_removes_only_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        store.save("keep", &sample_checkpoint()).await.unwrap();
        std::fs::write(
            dir.path().join(".state_crashed_abc.json.tmp"),
            "partial write",
        )
        .unwrap();

        store.cleanup_debris().await;

        assert!(store.exists("keep").await);
        assert!(!dir.path().join(".state_crashed_abc.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_sanitised_ids_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        store.save("a/b", &sample_checkpoint()).await.unwrap();
        // The sanitised form addresses the same checkpoint.
        assert!(store.exists("a_b").await);
    }
}

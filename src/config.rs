//! Configuration loading, migration and persistence.
//!
//! The configuration lives in a single human-readable YAML document:
//!
//! ```yaml
//! bots:
//!   telegram:
//!     token: "123456:ABC..."
//!     mode: webhook            # or "polling"
//!     webhook_url: "https://example.com/telegram/webhook"
//!   slack:
//!     token: "xoxb-..."
//!     signing_secret: "..."
//! index:
//!   paths: ["~/.claude/projects"]
//!   refresh_interval: 300
//! search:
//!   default_limit: 5
//! database:
//!   state_dir: "~/.tailcast/state"
//!   checkpoint_interval: 300
//!   backup:
//!     enabled: false
//! sessions:
//!   014d9d94-abc:
//!     path: /home/user/.claude/projects/x/014d9d94-abc.jsonl
//!     destinations:
//!       telegram: [{chat_id: "-1001234", thread_id: 42}]
//!       slack: [{channel: "C0123"}]
//! ```
//!
//! Two `sessions` shapes are accepted on read: the historical list form
//! `[{id, path}, …]` (migrated to the map form on the next write) and the map
//! form above. Missing `index`/`search`/`database` blocks are filled with
//! defaults. Environment variables override selected fields after file load:
//! `CLAUDE_INDEX_PATHS`, `CLAUDE_INDEX_REFRESH_INTERVAL`,
//! `TELEGRAM_WEBHOOK_URL`, `CLAUDE_STATE_DIR`, `CLAUDE_DB_CHECKPOINT_INTERVAL`.
//!
//! All writes are atomic: tempfile in the same directory + rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::util::expand_tilde;

/// Prefix/suffix for in-flight temp files, so crash debris is recognisable.
const TMP_PREFIX: &str = ".config_";
const TMP_SUFFIX: &str = ".yaml.tmp";

// ─── Destinations ────────────────────────────────────────────────────────────

/// A Telegram chat (optionally a supergroup topic) receiving session updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramDestination {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
}

/// A Slack channel receiving session updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlackDestination {
    pub channel: String,
}

/// All messaging destinations of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDestinations {
    #[serde(default)]
    pub telegram: Vec<TelegramDestination>,
    #[serde(default)]
    pub slack: Vec<SlackDestination>,
}

impl SessionDestinations {
    pub fn is_empty(&self) -> bool {
        self.telegram.is_empty() && self.slack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.telegram.len() + self.slack.len()
    }
}

// ─── Bot credentials ─────────────────────────────────────────────────────────

/// Telegram update delivery mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelegramMode {
    #[default]
    Webhook,
    Polling,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelegramBotConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub mode: TelegramMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlackBotConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
}

/// Bot credentials for both platforms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramBotConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackBotConfig>,
}

impl BotConfig {
    pub fn telegram_token(&self) -> Option<&str> {
        self.telegram.as_ref()?.token.as_deref()
    }

    pub fn slack_token(&self) -> Option<&str> {
        self.slack.as_ref()?.token.as_deref()
    }

    pub fn slack_signing_secret(&self) -> Option<&str> {
        self.slack.as_ref()?.signing_secret.as_deref()
    }

    /// Webhook mode requires a webhook URL.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref tg) = self.telegram {
            if tg.token.is_some()
                && tg.mode == TelegramMode::Webhook
                && tg.webhook_url.as_deref().is_none_or(str::is_empty)
            {
                return Err(
                    "telegram mode is 'webhook' but no webhook_url is configured".to_string()
                );
            }
        }
        Ok(())
    }
}

// ─── Derived config sections ─────────────────────────────────────────────────

/// Session indexing settings (consumed by the catalogue, carried here so the
/// document round-trips).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_paths")]
    pub paths: Vec<String>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default = "default_max_sessions_per_project")]
    pub max_sessions_per_project: usize,
    #[serde(default)]
    pub include_subagents: bool,
    #[serde(default = "default_true")]
    pub persist: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
    #[serde(default = "default_search_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_search_sort")]
    pub default_sort: String,
    #[serde(default = "default_search_ttl")]
    pub state_ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_backup_path")]
    pub path: String,
    #[serde(default = "default_backup_keep")]
    pub keep_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Seconds between periodic checkpoint saves. 0 disables the loop.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default)]
    pub vacuum_on_startup: bool,
    #[serde(default)]
    pub backup: BackupConfig,
}

impl DatabaseConfig {
    /// State directory with `~` expanded.
    pub fn state_dir_path(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.state_dir).as_ref())
    }
}

fn default_index_paths() -> Vec<String> {
    vec!["~/.claude/projects".to_string()]
}
fn default_refresh_interval() -> u64 {
    300
}
fn default_max_sessions_per_project() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_search_limit() -> usize {
    5
}
fn default_search_max_limit() -> usize {
    10
}
fn default_search_sort() -> String {
    "recent".to_string()
}
fn default_search_ttl() -> u64 {
    300
}
fn default_backup_path() -> String {
    "~/.tailcast/backups".to_string()
}
fn default_backup_keep() -> usize {
    3
}
fn default_state_dir() -> String {
    "~/.tailcast/state".to_string()
}
fn default_checkpoint_interval() -> u64 {
    300
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            paths: default_index_paths(),
            refresh_interval: default_refresh_interval(),
            max_sessions_per_project: default_max_sessions_per_project(),
            include_subagents: false,
            persist: default_true(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_search_limit(),
            max_limit: default_search_max_limit(),
            default_sort: default_search_sort(),
            state_ttl_seconds: default_search_ttl(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_backup_path(),
            keep_count: default_backup_keep(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            checkpoint_interval: default_checkpoint_interval(),
            vacuum_on_startup: false,
            backup: BackupConfig::default(),
        }
    }
}

// ─── Sessions ────────────────────────────────────────────────────────────────

/// One watched session: its transcript file and destinations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub path: PathBuf,
    #[serde(default)]
    pub destinations: SessionDestinations,
}

/// The full configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub bots: BotConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// session_id → entry. A BTreeMap keeps saves deterministic.
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionEntry>,
}

/// Historical list-form session record: `[{id, path}, …]`.
#[derive(Debug, Deserialize)]
struct LegacySessionEntry {
    id: String,
    path: PathBuf,
}

// ─── ConfigManager ───────────────────────────────────────────────────────────

/// Loads, migrates and persists the configuration document.
///
/// Every operation is load-modify-save against the file, so concurrent
/// processes and hand edits are picked up; callers serialise mutations
/// through the service.
#[derive(Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load the document, migrating legacy shapes and applying environment
    /// overrides. A missing or unparseable file yields the default (empty)
    /// document with a warning.
    pub fn load(&self) -> ConfigDocument {
        let mut doc = match std::fs::read_to_string(&self.config_path) {
            Ok(content) => match parse_document(&content) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(
                        "unparseable config {}: {e}, starting with empty config",
                        self.config_path.display()
                    );
                    ConfigDocument::default()
                }
            },
            Err(_) => ConfigDocument::default(),
        };
        apply_env_overrides(&mut doc);
        doc
    }

    /// Atomically persist the document (in the map form).
    pub fn save(&self, doc: &ConfigDocument) -> std::io::Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_yaml::to_string(doc)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let parent = self.config_path.parent().unwrap_or(Path::new("."));
        let tmp = parent.join(format!(
            "{TMP_PREFIX}{}{TMP_SUFFIX}",
            uuid::Uuid::new_v4().simple()
        ));

        if let Err(e) = std::fs::write(&tmp, data) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        if let Err(e) = std::fs::rename(&tmp, &self.config_path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }

    /// Remove temp-file debris left behind by a crash mid-save.
    pub fn cleanup_debris(&self) {
        let Some(parent) = self.config_path.parent() else {
            return;
        };
        let Ok(entries) = std::fs::read_dir(parent) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(TMP_PREFIX) && name.ends_with(TMP_SUFFIX) {
                warn!("removing stale config temp file: {name}");
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.load().sessions.get(session_id).cloned()
    }

    /// Add a session if absent. Idempotent on an existing id with the same
    /// path.
    pub fn add_session(&self, session_id: &str, path: &Path) -> std::io::Result<()> {
        let mut doc = self.load();
        doc.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                path: path.to_path_buf(),
                destinations: SessionDestinations::default(),
            });
        self.save(&doc)
    }

    /// Remove a session. Returns whether it was present.
    pub fn remove_session(&self, session_id: &str) -> std::io::Result<bool> {
        let mut doc = self.load();
        let removed = doc.sessions.remove(session_id).is_some();
        if removed {
            self.save(&doc)?;
        }
        Ok(removed)
    }

    /// Add a Telegram destination. Idempotent: returns `Ok(false)` when the
    /// same (chat_id, thread_id) is already present.
    pub fn add_telegram_destination(
        &self,
        session_id: &str,
        dest: &TelegramDestination,
    ) -> std::io::Result<bool> {
        let mut doc = self.load();
        let Some(entry) = doc.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        if entry.destinations.telegram.contains(dest) {
            return Ok(false);
        }
        entry.destinations.telegram.push(dest.clone());
        self.save(&doc)?;
        Ok(true)
    }

    pub fn add_slack_destination(
        &self,
        session_id: &str,
        dest: &SlackDestination,
    ) -> std::io::Result<bool> {
        let mut doc = self.load();
        let Some(entry) = doc.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        if entry.destinations.slack.contains(dest) {
            return Ok(false);
        }
        entry.destinations.slack.push(dest.clone());
        self.save(&doc)?;
        Ok(true)
    }

    /// Remove a Telegram destination. Absent destinations are not an error.
    pub fn remove_telegram_destination(
        &self,
        session_id: &str,
        dest: &TelegramDestination,
    ) -> std::io::Result<bool> {
        let mut doc = self.load();
        let Some(entry) = doc.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        let before = entry.destinations.telegram.len();
        entry.destinations.telegram.retain(|d| d != dest);
        let removed = entry.destinations.telegram.len() != before;
        if removed {
            self.save(&doc)?;
        }
        Ok(removed)
    }

    pub fn remove_slack_destination(
        &self,
        session_id: &str,
        dest: &SlackDestination,
    ) -> std::io::Result<bool> {
        let mut doc = self.load();
        let Some(entry) = doc.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        let before = entry.destinations.slack.len();
        entry.destinations.slack.retain(|d| d != dest);
        let removed = entry.destinations.slack.len() != before;
        if removed {
            self.save(&doc)?;
        }
        Ok(removed)
    }
}

/// Parse YAML, accepting both session shapes.
fn parse_document(content: &str) -> Result<ConfigDocument, serde_yaml::Error> {
    let mut value: serde_yaml::Value = serde_yaml::from_str(content)?;
    if value.is_null() {
        return Ok(ConfigDocument::default());
    }

    // Legacy shape: sessions as a list of {id, path}. Migrate in place.
    if let Some(sessions) = value.get("sessions") {
        if sessions.is_sequence() {
            let legacy: Vec<LegacySessionEntry> =
                serde_yaml::from_value(sessions.clone()).unwrap_or_default();
            let mut map = serde_yaml::Mapping::new();
            for entry in legacy {
                map.insert(
                    serde_yaml::Value::String(entry.id),
                    serde_yaml::to_value(SessionEntry {
                        path: entry.path,
                        destinations: SessionDestinations::default(),
                    })?,
                );
            }
            value["sessions"] = serde_yaml::Value::Mapping(map);
        }
    }

    serde_yaml::from_value(value)
}

/// Apply environment variable overrides to a loaded document.
fn apply_env_overrides(doc: &mut ConfigDocument) {
    apply_overrides_from(doc, |name| std::env::var(name).ok());
}

fn apply_overrides_from(doc: &mut ConfigDocument, var: impl Fn(&str) -> Option<String>) {
    if let Some(paths) = var("CLAUDE_INDEX_PATHS") {
        doc.index.paths = paths
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
    }
    if let Some(interval) = var("CLAUDE_INDEX_REFRESH_INTERVAL") {
        if let Ok(interval) = interval.parse() {
            doc.index.refresh_interval = interval;
        }
    }
    if let Some(url) = var("TELEGRAM_WEBHOOK_URL") {
        doc.bots
            .telegram
            .get_or_insert_with(TelegramBotConfig::default)
            .webhook_url = Some(url);
    }
    if let Some(dir) = var("CLAUDE_STATE_DIR") {
        doc.database.state_dir = dir;
    }
    if let Some(interval) = var("CLAUDE_DB_CHECKPOINT_INTERVAL") {
        if let Ok(interval) = interval.parse() {
            doc.database.checkpoint_interval = interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir) -> ConfigManager {
        ConfigManager::new(dir.path().join("config.yaml"))
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let doc = manager(&dir).load();
        assert!(doc.sessions.is_empty());
        assert_eq!(doc.index.refresh_interval, 300);
        assert_eq!(doc.search.default_limit, 5);
        assert_eq!(doc.database.checkpoint_interval, 300);
    }

    #[test]
    fn test_unparseable_file_yields_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        std::fs::write(mgr.config_path(), ":\n  - [broken").unwrap();
        let doc = mgr.load();
        assert!(doc.sessions.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let mut doc = ConfigDocument {
            bots: BotConfig {
                telegram: Some(TelegramBotConfig {
                    token: Some("123:abc".into()),
                    mode: TelegramMode::Polling,
                    webhook_url: None,
                }),
                slack: None,
            },
            ..ConfigDocument::default()
        };
        doc.sessions.insert(
            "sess-1".into(),
            SessionEntry {
                path: PathBuf::from("/tmp/sess-1.jsonl"),
                destinations: SessionDestinations {
                    telegram: vec![TelegramDestination {
                        chat_id: "-100123".into(),
                        thread_id: Some(7),
                    }],
                    slack: vec![SlackDestination {
                        channel: "C0123".into(),
                    }],
                },
            },
        );
        mgr.save(&doc).unwrap();

        let loaded = mgr.load();
        assert_eq!(loaded.bots, doc.bots);
        assert_eq!(loaded.sessions, doc.sessions);
    }

    #[test]
    fn test_legacy_list_form_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        std::fs::write(
            mgr.config_path(),
            "sessions:\n  - id: old-1\n    path: /tmp/old-1.jsonl\n  - id: old-2\n    path: /tmp/old-2.jsonl\n",
        )
        .unwrap();

        let doc = mgr.load();
        assert_eq!(doc.sessions.len(), 2);
        let entry = &doc.sessions["old-1"];
        assert_eq!(entry.path, PathBuf::from("/tmp/old-1.jsonl"));
        assert!(entry.destinations.is_empty());

        // The next save persists the map form.
        mgr.save(&doc).unwrap();
        let raw = std::fs::read_to_string(mgr.config_path()).unwrap();
        assert!(raw.contains("old-1:"));
        let reloaded = mgr.load();
        assert_eq!(reloaded.sessions, doc.sessions);
    }

    #[test]
    fn test_add_destination_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.add_session("s", Path::new("/tmp/s.jsonl")).unwrap();

        let dest = TelegramDestination {
            chat_id: "42".into(),
            thread_id: None,
        };
        assert!(mgr.add_telegram_destination("s", &dest).unwrap());
        assert!(!mgr.add_telegram_destination("s", &dest).unwrap());
        assert_eq!(mgr.get("s").unwrap().destinations.telegram.len(), 1);
    }

    #[test]
    fn test_remove_absent_destination_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.add_session("s", Path::new("/tmp/s.jsonl")).unwrap();

        let dest = SlackDestination {
            channel: "C9".into(),
        };
        assert!(!mgr.remove_slack_destination("s", &dest).unwrap());
        assert!(!mgr.remove_slack_destination("missing", &dest).unwrap());
    }

    #[test]
    fn test_same_chat_different_threads_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        mgr.add_session("s", Path::new("/tmp/s.jsonl")).unwrap();

        let base = TelegramDestination {
            chat_id: "-100".into(),
            thread_id: None,
        };
        let topic = TelegramDestination {
            chat_id: "-100".into(),
            thread_id: Some(9),
        };
        assert!(mgr.add_telegram_destination("s", &base).unwrap());
        assert!(mgr.add_telegram_destination("s", &topic).unwrap());
        assert_eq!(mgr.get("s").unwrap().destinations.telegram.len(), 2);
    }

    #[test]
    fn test_bot_config_webhook_requires_url() {
        let bots = BotConfig {
            telegram: Some(TelegramBotConfig {
                token: Some("t".into()),
                mode: TelegramMode::Webhook,
                webhook_url: None,
            }),
            slack: None,
        };
        assert!(bots.validate().is_err());

        let bots = BotConfig {
            telegram: Some(TelegramBotConfig {
                token: Some("t".into()),
                mode: TelegramMode::Polling,
                webhook_url: None,
            }),
            slack: None,
        };
        assert!(bots.validate().is_ok());
    }

    #[test]
    fn test_cleanup_debris() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        std::fs::write(dir.path().join(".config_dead.yaml.tmp"), "junk").unwrap();
        mgr.cleanup_debris();
        assert!(!dir.path().join(".config_dead.yaml.tmp").exists());
    }

    #[test]
    fn test_env_overrides() {
        let vars: std::collections::HashMap<&str, &str> = [
            ("CLAUDE_INDEX_PATHS", "/a, /b"),
            ("CLAUDE_INDEX_REFRESH_INTERVAL", "60"),
            ("TELEGRAM_WEBHOOK_URL", "https://hook.example"),
            ("CLAUDE_STATE_DIR", "/var/lib/tc"),
            ("CLAUDE_DB_CHECKPOINT_INTERVAL", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut doc = ConfigDocument::default();
        apply_overrides_from(&mut doc, |name| {
            vars.get(name).map(ToString::to_string)
        });

        assert_eq!(doc.index.paths, vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(doc.index.refresh_interval, 60);
        assert_eq!(
            doc.bots.telegram.unwrap().webhook_url.as_deref(),
            Some("https://hook.example")
        );
        assert_eq!(doc.database.state_dir, "/var/lib/tc");
        // Invalid integers are ignored.
        assert_eq!(doc.database.checkpoint_interval, 300);
    }
}

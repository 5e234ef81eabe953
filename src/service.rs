//! The orchestrator: wires tailer → transformer → buffers → SSE / render /
//! debounce / platform clients, and owns every session's lifecycle.
//!
//! Per session the lifecycle is Unknown → Watching → Draining → Unknown:
//! the first attach starts watching, the last detach arms the keep-alive,
//! and an expired keep-alive (or a deleted transcript file) tears the
//! session down. All mutation flows through this service; HTTP handlers
//! call into it and the component locks serialise access.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bindings::{BindingSet, MessageBinding};
use crate::buffer::EventBuffers;
use crate::checkpoint::{CheckpointStore, SessionCheckpoint};
use crate::config::{
    ConfigManager, SessionDestinations, SlackDestination, TelegramDestination,
};
use crate::debounce::{Debouncer, Payload, ScheduleOutcome, UpdateFn};
use crate::destinations::{
    make_telegram_identifier, parse_telegram_identifier, DestinationRegistry,
    RestoredDestinations, DEFAULT_KEEP_ALIVE,
};
use crate::platform::{DestinationKind, PlatformError, SlackClient, TelegramClient};
use crate::render::{Preset, RenderCache};
use crate::sse::{CloseReason, SseFrame, SseHub};
use crate::tailer::{LineBatch, Tailer};
use crate::transform::transform;
use crate::util::unix_now;

/// Records replayed through the pipeline when a fresh watch starts.
const DEFAULT_REPLAY_COUNT: usize = 3;

/// Cadence of the maintenance loop (cache eviction, binding reaping).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Idle threshold for render cache eviction.
const RENDER_CACHE_IDLE: Duration = Duration::from_secs(30 * 60);

/// A destination as given at the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationSpec {
    Telegram {
        chat_id: String,
        thread_id: Option<i64>,
    },
    Slack {
        channel: String,
    },
}

impl DestinationSpec {
    pub fn kind(&self) -> DestinationKind {
        match self {
            Self::Telegram { .. } => DestinationKind::Telegram,
            Self::Slack { .. } => DestinationKind::Slack,
        }
    }

    /// The runtime identifier: `chat_id[:thread_id]` or the channel.
    pub fn identifier(&self) -> String {
        match self {
            Self::Telegram { chat_id, thread_id } => {
                make_telegram_identifier(chat_id, *thread_id)
            }
            Self::Slack { channel } => channel.clone(),
        }
    }
}

/// Errors surfaced to the HTTP boundary by attach/detach.
#[derive(Debug)]
pub enum ServiceError {
    /// Bad input; maps to 400.
    Validation(String),
    /// Session or file not found; maps to 404.
    NotFound(String),
    /// Credentials absent for the requested platform; maps to 401.
    CredentialsAbsent(&'static str),
    /// Credentials present but rejected; maps to 403.
    CredentialsRejected(String),
    /// Platform or storage failure; maps to 502.
    Upstream(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) | Self::NotFound(msg) | Self::Upstream(msg) => {
                write!(f, "{msg}")
            }
            Self::CredentialsAbsent(platform) => {
                write!(f, "{platform} bot token not configured")
            }
            Self::CredentialsRejected(msg) => write!(f, "credentials rejected: {msg}"),
        }
    }
}

impl std::error::Error for ServiceError {}

/// Result of a successful attach.
#[derive(Debug)]
pub struct AttachOutcome {
    /// False when the destination was already attached (idempotent call).
    pub attached: bool,
    pub message_id: Option<String>,
    pub replayed_events: usize,
}

/// Summary row for `GET /sessions`.
#[derive(Debug)]
pub struct SessionSummary {
    pub session_id: String,
    pub path: PathBuf,
    pub destinations: SessionDestinations,
    pub sse_clients: usize,
}

struct ServiceChannels {
    batches: mpsc::Receiver<LineBatch>,
    deleted: mpsc::Receiver<String>,
    expired: mpsc::Receiver<String>,
}

/// The watcher service. Construct with [`WatcherService::new`], call
/// [`start`](Self::start) once, and [`stop`](Self::stop) on shutdown.
pub struct WatcherService {
    config: ConfigManager,
    checkpoints: CheckpointStore,
    tailer: Tailer,
    buffers: EventBuffers,
    sse: SseHub,
    render: RenderCache,
    bindings: BindingSet,
    debouncer: Debouncer,
    registry: DestinationRegistry,
    telegram: Option<Arc<TelegramClient>>,
    slack: Option<Arc<SlackClient>>,
    slack_signing_secret: Option<String>,
    checkpoint_interval: u64,
    start_time: Instant,
    cancel: CancellationToken,
    channels: Mutex<Option<ServiceChannels>>,
}

impl WatcherService {
    /// Build the service from a configuration file and state directory.
    ///
    /// Fails when the bot credential configuration is invalid (e.g. webhook
    /// mode without a webhook URL).
    pub fn new(config_path: PathBuf, state_dir: PathBuf) -> Result<Self, String> {
        let config = ConfigManager::new(config_path);
        let doc = config.load();
        doc.bots.validate()?;

        let telegram = doc
            .bots
            .telegram_token()
            .map(|token| Arc::new(TelegramClient::new(token)));
        let slack = doc
            .bots
            .slack_token()
            .map(|token| Arc::new(SlackClient::new(token)));
        let slack_signing_secret = doc.bots.slack_signing_secret().map(ToString::to_string);

        let (batches_tx, batches_rx) = mpsc::channel(64);
        let (deleted_tx, deleted_rx) = mpsc::channel(16);
        let (expired_tx, expired_rx) = mpsc::channel(16);

        let buffers = EventBuffers::new();
        Ok(Self {
            checkpoints: CheckpointStore::new(state_dir),
            tailer: Tailer::new(batches_tx, deleted_tx),
            sse: SseHub::new(buffers.clone()),
            buffers,
            render: RenderCache::new(),
            bindings: BindingSet::new(),
            debouncer: Debouncer::default(),
            registry: DestinationRegistry::new(DEFAULT_KEEP_ALIVE, expired_tx),
            telegram,
            slack,
            slack_signing_secret,
            checkpoint_interval: doc.database.checkpoint_interval,
            config,
            start_time: Instant::now(),
            cancel: CancellationToken::new(),
            channels: Mutex::new(Some(ServiceChannels {
                batches: batches_rx,
                deleted: deleted_rx,
                expired: expired_rx,
            })),
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn telegram_configured(&self) -> bool {
        self.telegram.is_some()
    }

    pub fn slack_configured(&self) -> bool {
        self.slack.is_some()
    }

    pub fn slack_signing_secret(&self) -> Option<&str> {
        self.slack_signing_secret.as_deref()
    }

    pub fn telegram_client(&self) -> Option<Arc<TelegramClient>> {
        self.telegram.clone()
    }

    pub fn bindings(&self) -> &BindingSet {
        &self.bindings
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Restore persisted sessions and spawn the background tasks.
    pub async fn start(self: &Arc<Self>) -> std::io::Result<()> {
        self.config.cleanup_debris();
        self.checkpoints.cleanup_debris().await;
        tokio::fs::create_dir_all(self.checkpoints.state_dir()).await?;

        self.restore_sessions().await;

        self.tailer.start(self.cancel.clone());

        let service = Arc::clone(self);
        tokio::spawn(async move { service.event_loop().await });

        let service = Arc::clone(self);
        tokio::spawn(async move { service.maintenance_loop().await });

        if self.checkpoint_interval > 0 {
            let service = Arc::clone(self);
            tokio::spawn(async move { service.checkpoint_loop().await });
        }

        info!("watcher service started");
        Ok(())
    }

    /// Load config, resume each session from its checkpoint, and restore the
    /// destination registry. Sessions whose file vanished are dropped from
    /// config.
    async fn restore_sessions(&self) {
        let doc = self.config.load();
        let mut resumed = 0usize;

        for (session_id, entry) in &doc.sessions {
            if !entry.path.exists() {
                warn!(
                    "session file no longer exists, removing: {session_id} ({})",
                    entry.path.display()
                );
                let _ = self.config.remove_session(session_id);
                self.checkpoints.delete(session_id).await;
                continue;
            }

            let start_position = match self.checkpoints.load(session_id).await {
                Some(checkpoint) => {
                    info!(
                        "resuming {session_id} from position {}",
                        checkpoint.file_position
                    );
                    self.buffers
                        .ensure_session(session_id, checkpoint.last_event_seq + 1)
                        .await;
                    checkpoint.file_position
                }
                None => {
                    info!("no saved state for {session_id}, starting at end of file");
                    self.buffers.ensure_session(session_id, 1).await;
                    std::fs::metadata(&entry.path).map(|m| m.len()).unwrap_or(0)
                }
            };

            self.tailer.add(session_id, &entry.path, start_position).await;
            resumed += 1;
        }

        let entries: RestoredDestinations = doc
            .sessions
            .iter()
            .map(|(session_id, entry)| {
                let mut list = Vec::new();
                for tg in &entry.destinations.telegram {
                    list.push((
                        DestinationKind::Telegram,
                        make_telegram_identifier(&tg.chat_id, tg.thread_id),
                    ));
                }
                for sl in &entry.destinations.slack {
                    list.push((DestinationKind::Slack, sl.channel.clone()));
                }
                (session_id.clone(), list)
            })
            .collect();
        let started = self.registry.restore(entries).await;

        info!(
            "restored {resumed} session(s), {} with destinations",
            started.len()
        );
    }

    /// Graceful shutdown: stop ingest, flush pending writes, persist
    /// checkpoints, end every SSE stream.
    pub async fn stop(&self) {
        info!("stopping watcher service");
        self.cancel.cancel();

        self.debouncer.flush().await;
        self.registry.shutdown().await;
        self.save_all_checkpoints().await;

        let doc = self.config.load();
        for session_id in doc.sessions.keys() {
            self.sse.close_session(session_id, CloseReason::Shutdown).await;
        }
        // Subscribers of sessions no longer in config still get the
        // terminal frame.
        for session_id in self.sse.active_sessions().await {
            self.sse.close_session(&session_id, CloseReason::Shutdown).await;
        }
        info!("watcher service stopped");
    }

    async fn event_loop(self: Arc<Self>) {
        let Some(mut channels) = self.channels.lock().await.take() else {
            error!("event loop started twice");
            return;
        };

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                batch = channels.batches.recv() => match batch {
                    Some(batch) => {
                        self.handle_lines(&batch.session_id, &batch.records).await;
                    }
                    None => break,
                },
                deleted = channels.deleted.recv() => match deleted {
                    Some(session_id) => self.on_file_deleted(&session_id).await,
                    None => break,
                },
                expired = channels.expired.recv() => match expired {
                    Some(session_id) => self.on_keep_alive_expired(&session_id).await,
                    None => break,
                },
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            // Sessions with bindings or attached destinations stay cached.
            let mut keep = self.bindings.sessions_with_bindings().await;
            for session_id in self.sessions_with_destinations().await {
                if !keep.contains(&session_id) {
                    keep.push(session_id);
                }
            }
            self.render.evict_idle(RENDER_CACHE_IDLE, &keep).await;

            for reaped in self.bindings.reap_expired().await {
                self.debouncer
                    .clear_content(reaped.kind, &reaped.identifier, &reaped.message_id)
                    .await;
            }
        }
    }

    async fn sessions_with_destinations(&self) -> Vec<String> {
        let doc = self.config.load();
        doc.sessions
            .into_iter()
            .filter(|(_, entry)| !entry.destinations.is_empty())
            .map(|(session_id, _)| session_id)
            .collect()
    }

    async fn checkpoint_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.checkpoint_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.save_all_checkpoints().await;
        }
    }

    async fn save_all_checkpoints(&self) {
        for session_id in self.tailer.watched_sessions().await {
            let Some(position) = self.tailer.position(&session_id).await else {
                continue;
            };
            let previous = self.checkpoints.load(&session_id).await;
            let (line_number, transformer_context) = previous
                .map(|c| (c.line_number, c.transformer_context))
                .unwrap_or_default();
            let checkpoint = SessionCheckpoint {
                file_position: position,
                line_number,
                transformer_context,
                last_event_seq: self.buffers.last_seq(&session_id).await,
                last_modified: unix_now(),
            };
            if let Err(e) = self.checkpoints.save(&session_id, &checkpoint).await {
                warn!("failed to save checkpoint for {session_id}: {e}");
            }
        }
    }

    // ─── Record batch flow ───────────────────────────────────────────────────

    /// Process a batch of raw records for a session: transform, checkpoint,
    /// buffer + broadcast, re-render, push to bindings. Returns the number
    /// of derived events.
    pub async fn handle_lines(&self, session_id: &str, records: &[serde_json::Value]) -> usize {
        if records.is_empty() {
            return 0;
        }

        let previous = self.checkpoints.load(session_id).await;
        let (line_number, context) = previous
            .map(|c| (c.line_number, c.transformer_context))
            .unwrap_or_default();

        let (events, new_context) = transform(records, &context);

        let position = self
            .tailer
            .position(session_id)
            .await
            .unwrap_or_default();
        let checkpoint = SessionCheckpoint {
            file_position: position,
            line_number: line_number + records.len() as u64,
            transformer_context: new_context,
            last_event_seq: self.buffers.seq_after(session_id, events.len()).await,
            last_modified: unix_now(),
        };
        if let Err(e) = self.checkpoints.save(session_id, &checkpoint).await {
            warn!("failed to save checkpoint for {session_id}: {e}");
        }

        for event in &events {
            let event_id = self.buffers.add_event(session_id, event.clone()).await;
            self.sse.broadcast(session_id, &event_id, event).await;
        }

        if !events.is_empty() {
            let all_events = self.buffers.events(session_id).await;
            self.render.rebuild(session_id, &all_events).await;
            self.push_to_bindings(session_id).await;
        }

        events.len()
    }

    /// Schedule a debounced push of the current render to every binding of a
    /// session.
    async fn push_to_bindings(&self, session_id: &str) {
        for binding in self.bindings.for_session(session_id).await {
            let Some(content) = self.render.get(session_id, binding.preset).await else {
                continue;
            };
            let update_fn = self.delivery_fn(&binding, content.clone());
            let outcome = self
                .debouncer
                .schedule(
                    binding.kind,
                    &binding.identifier,
                    &binding.message_id,
                    update_fn,
                    Payload::Text(content),
                )
                .await;
            if outcome == ScheduleOutcome::Skipped {
                tracing::debug!(
                    "render unchanged for {}:{}, update suppressed",
                    binding.kind.as_str(),
                    binding.identifier
                );
            }
        }
    }

    /// Build the delivery closure for one binding: update the live message,
    /// re-sending (and re-binding) when the platform lost it.
    fn delivery_fn(&self, binding: &MessageBinding, content: String) -> UpdateFn {
        let telegram = self.telegram.clone();
        let slack = self.slack.clone();
        let bindings = self.bindings.clone();
        let render = self.render.clone();
        let binding = binding.clone();

        Arc::new(move || {
            let telegram = telegram.clone();
            let slack = slack.clone();
            let bindings = bindings.clone();
            let render = render.clone();
            let binding = binding.clone();
            let content = content.clone();

            Box::pin(async move {
                let question = render.pending_question(&binding.session_id).await;
                let delivered = match binding.kind {
                    DestinationKind::Telegram => {
                        let Some(client) = telegram else { return false };
                        let (chat_id, _) = parse_telegram_identifier(&binding.identifier);
                        let message_id: i64 = binding.message_id.parse().unwrap_or(0);
                        match client
                            .update_session_message(
                                &chat_id,
                                message_id,
                                &content,
                                question.as_ref(),
                            )
                            .await
                        {
                            Ok(true) => true,
                            Ok(false) => {
                                // Message lost; send a fresh one and rebind.
                                let (chat_id, thread_id) =
                                    parse_telegram_identifier(&binding.identifier);
                                match client
                                    .send_session_message(
                                        &chat_id,
                                        &content,
                                        thread_id,
                                        question.as_ref(),
                                    )
                                    .await
                                {
                                    Ok(new_id) => {
                                        bindings
                                            .replace_message_id(
                                                &binding.session_id,
                                                binding.kind,
                                                &binding.identifier,
                                                &new_id.to_string(),
                                            )
                                            .await;
                                        true
                                    }
                                    Err(e) => {
                                        warn!("telegram re-send failed: {e}");
                                        false
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("telegram update failed: {e}");
                                false
                            }
                        }
                    }
                    DestinationKind::Slack => {
                        let Some(client) = slack else { return false };
                        match client
                            .update_session_message(
                                &binding.identifier,
                                &binding.message_id,
                                &content,
                                question.as_ref(),
                            )
                            .await
                        {
                            Ok(true) => true,
                            Ok(false) => {
                                match client
                                    .send_session_message(
                                        &binding.identifier,
                                        &content,
                                        question.as_ref(),
                                    )
                                    .await
                                {
                                    Ok(new_ts) => {
                                        bindings
                                            .replace_message_id(
                                                &binding.session_id,
                                                binding.kind,
                                                &binding.identifier,
                                                &new_ts,
                                            )
                                            .await;
                                        true
                                    }
                                    Err(e) => {
                                        warn!("slack re-send failed: {e}");
                                        false
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("slack update failed: {e}");
                                false
                            }
                        }
                    }
                };

                if delivered {
                    bindings
                        .update_last_content(
                            &binding.session_id,
                            binding.kind,
                            &binding.identifier,
                            &content,
                        )
                        .await;
                }
                delivered
            })
        })
    }

    // ─── Teardown paths ──────────────────────────────────────────────────────

    /// The watched file disappeared: end the session entirely.
    async fn on_file_deleted(&self, session_id: &str) {
        warn!("session file deleted: {session_id}");
        self.sse
            .close_session(session_id, CloseReason::FileDeleted)
            .await;
        self.buffers.remove(session_id).await;
        self.render.remove(session_id).await;
        self.checkpoints.delete(session_id).await;
        let _ = self.config.remove_session(session_id);
        self.registry.clear_session(session_id).await;
        for binding in self.bindings.clear_session(session_id).await {
            self.debouncer
                .clear_content(binding.kind, &binding.identifier, &binding.message_id)
                .await;
        }
    }

    /// Keep-alive elapsed with no destinations: stop watching. The config
    /// entry survives so a later attach can resume without a path.
    async fn on_keep_alive_expired(&self, session_id: &str) {
        info!("stopping session after keep-alive: {session_id}");
        self.sse
            .close_session(session_id, CloseReason::NoDestinations)
            .await;
        self.tailer.remove(session_id).await;
        self.buffers.remove(session_id).await;
        self.render.remove(session_id).await;
        self.checkpoints.delete(session_id).await;
        for binding in self.bindings.clear_session(session_id).await {
            self.debouncer
                .clear_content(binding.kind, &binding.identifier, &binding.message_id)
                .await;
        }
    }

    // ─── Attach / detach ─────────────────────────────────────────────────────

    /// Attach a destination to a session, creating the live platform message.
    pub async fn attach(
        &self,
        session_id: &str,
        path: Option<&Path>,
        spec: &DestinationSpec,
        preset: Preset,
        replay_count: Option<usize>,
    ) -> Result<AttachOutcome, ServiceError> {
        let kind = spec.kind();
        let identifier = spec.identifier();

        // Credential gate for the requested platform.
        match kind {
            DestinationKind::Telegram => {
                let client = self
                    .telegram
                    .as_ref()
                    .ok_or(ServiceError::CredentialsAbsent("telegram"))?;
                map_validate(client.validate().await)?;
            }
            DestinationKind::Slack => {
                let client = self
                    .slack
                    .as_ref()
                    .ok_or(ServiceError::CredentialsAbsent("slack"))?;
                map_validate(client.validate().await)?;
            }
        }

        // Resolve the session's transcript path.
        let known = self.config.get(session_id);
        let session_path = match (&known, path) {
            (Some(entry), _) => entry.path.clone(),
            (None, Some(path)) => {
                if !path.exists() {
                    return Err(ServiceError::NotFound(format!(
                        "session file not found: {}",
                        path.display()
                    )));
                }
                path.to_path_buf()
            }
            (None, None) => {
                return Err(ServiceError::Validation(format!(
                    "unknown session {session_id} and no path given"
                )));
            }
        };

        let result = self.registry.attach(session_id, kind, &identifier).await;
        if !result.added {
            let existing = self.bindings.find(session_id, kind, &identifier).await;
            return Ok(AttachOutcome {
                attached: false,
                message_id: existing.map(|b| b.message_id),
                replayed_events: 0,
            });
        }

        // Persist.
        self.config
            .add_session(session_id, &session_path)
            .map_err(|e| ServiceError::Upstream(e.to_string()))?;
        let persisted = match spec {
            DestinationSpec::Telegram { chat_id, thread_id } => {
                self.config.add_telegram_destination(
                    session_id,
                    &TelegramDestination {
                        chat_id: chat_id.clone(),
                        thread_id: *thread_id,
                    },
                )
            }
            DestinationSpec::Slack { channel } => self.config.add_slack_destination(
                session_id,
                &SlackDestination {
                    channel: channel.clone(),
                },
            ),
        };
        if let Err(e) = persisted {
            warn!("failed to persist destination for {session_id}: {e}");
        }

        // Start (or keep) watching, replaying recent records for context.
        let mut replayed_events = 0;
        if !self.tailer.is_watching(session_id).await {
            let start_position = std::fs::metadata(&session_path)
                .map(|m| m.len())
                .unwrap_or(0);
            self.buffers.ensure_session(session_id, 1).await;
            self.tailer.add(session_id, &session_path, start_position).await;

            let n = replay_count.unwrap_or(DEFAULT_REPLAY_COUNT);
            if n > 0 {
                let records = self.tailer.replay_last(session_id, n).await;
                replayed_events = self.handle_lines(session_id, &records).await;
            }
        } else if let Some(n) = replay_count {
            // Already watching: a requested replay still primes the buffer.
            if n > 0 && self.buffers.events(session_id).await.is_empty() {
                let records = self.tailer.replay_last(session_id, n).await;
                replayed_events = self.handle_lines(session_id, &records).await;
            }
        }

        let message_id = self
            .create_binding(session_id, spec, preset)
            .await
            .map_err(|e| ServiceError::Upstream(e.to_string()))?;

        Ok(AttachOutcome {
            attached: true,
            message_id: Some(message_id),
            replayed_events,
        })
    }

    /// Send the initial live message and record the binding.
    async fn create_binding(
        &self,
        session_id: &str,
        spec: &DestinationSpec,
        preset: Preset,
    ) -> Result<String, PlatformError> {
        let content = match self.render.get(session_id, preset).await {
            Some(content) => content,
            None => {
                let events = self.buffers.events(session_id).await;
                self.render.rebuild(session_id, &events).await;
                self.render
                    .get(session_id, preset)
                    .await
                    .unwrap_or_default()
            }
        };
        let display = if content.is_empty() {
            format!("📡 Watching session {session_id}")
        } else {
            content.clone()
        };
        let question = self.render.pending_question(session_id).await;

        let (kind, identifier) = (spec.kind(), spec.identifier());
        let message_id = match spec {
            DestinationSpec::Telegram { chat_id, thread_id } => {
                let client = self
                    .telegram
                    .as_ref()
                    .ok_or(PlatformError::NotConfigured("telegram"))?;
                client
                    .send_session_message(chat_id, &display, *thread_id, question.as_ref())
                    .await?
                    .to_string()
            }
            DestinationSpec::Slack { channel } => {
                let client = self
                    .slack
                    .as_ref()
                    .ok_or(PlatformError::NotConfigured("slack"))?;
                client
                    .send_session_message(channel, &display, question.as_ref())
                    .await?
            }
        };

        self.bindings
            .add(MessageBinding::new(
                session_id,
                preset,
                kind,
                &identifier,
                &message_id,
                content,
            ))
            .await;
        info!(
            "created binding {}:{identifier} → message {message_id} for {session_id}",
            kind.as_str()
        );
        Ok(message_id)
    }

    /// Detach a destination. Errors with `NotFound` when it was not
    /// attached.
    pub async fn detach(
        &self,
        session_id: &str,
        spec: &DestinationSpec,
    ) -> Result<(), ServiceError> {
        let kind = spec.kind();
        let identifier = spec.identifier();

        if !self.registry.detach(session_id, kind, &identifier).await {
            return Err(ServiceError::NotFound(format!(
                "destination not attached: {}:{identifier}",
                kind.as_str()
            )));
        }

        let removed = match spec {
            DestinationSpec::Telegram { chat_id, thread_id } => {
                self.config.remove_telegram_destination(
                    session_id,
                    &TelegramDestination {
                        chat_id: chat_id.clone(),
                        thread_id: *thread_id,
                    },
                )
            }
            DestinationSpec::Slack { channel } => self.config.remove_slack_destination(
                session_id,
                &SlackDestination {
                    channel: channel.clone(),
                },
            ),
        };
        if let Err(e) = removed {
            warn!("failed to unpersist destination for {session_id}: {e}");
        }

        if let Some(binding) = self.bindings.remove(session_id, kind, &identifier).await {
            self.debouncer
                .clear_content(binding.kind, &binding.identifier, &binding.message_id)
                .await;
        }
        Ok(())
    }

    // ─── Queries for the HTTP surface ────────────────────────────────────────

    pub async fn session_known(&self, session_id: &str) -> bool {
        self.config.get(session_id).is_some()
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let doc = self.config.load();
        let mut summaries = Vec::with_capacity(doc.sessions.len());
        for (session_id, entry) in doc.sessions {
            let sse_clients = self.sse.client_count(&session_id).await;
            summaries.push(SessionSummary {
                session_id,
                path: entry.path,
                destinations: entry.destinations,
                sse_clients,
            });
        }
        summaries
    }

    pub async fn sessions_watched(&self) -> usize {
        self.config.load().sessions.len()
    }

    /// Open an SSE subscription (replay + live).
    pub async fn subscribe(
        &self,
        session_id: &str,
        last_event_id: Option<&str>,
    ) -> mpsc::Receiver<SseFrame> {
        self.sse.connect(session_id, last_event_id).await
    }
}

fn map_validate(result: Result<(), PlatformError>) -> Result<(), ServiceError> {
    match result {
        Ok(()) => Ok(()),
        Err(PlatformError::Auth(msg)) => Err(ServiceError::CredentialsRejected(msg)),
        Err(PlatformError::NotConfigured(platform)) => {
            Err(ServiceError::CredentialsAbsent(platform))
        }
        Err(PlatformError::Transient(msg)) => Err(ServiceError::Upstream(msg)),
    }
}
